//! End-to-end serving over loopback.

use std::fs;
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::{ Arc, Mutex };
use std::thread;

use sha2::{ Digest, Sha256 };
use tunestream_core::output::OutputError;
use tunestream_core::{
    AudioDevice, Catalog, LoopExit, PcmFormat, PlaybackEngine, ServeReport, SinkLine, StreamClient, StreamServer,
};


fn write_wav( path: &Path, sample_rate: u32, channels: u16, frames: usize ) -> Vec<i16> {
    let spec = hound::WavSpec {
        channels,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let samples: Vec<i16> = ( 0..frames * channels as usize )
        .map( |i| ( ( i * 97 ) % 20_000 ) as i16 - 10_000 )
        .collect();

    let mut writer = hound::WavWriter::create( path, spec ).unwrap();
    for &sample in &samples {
        writer.write_sample( sample ).unwrap();
    }
    writer.finalize().unwrap();
    samples
}


fn digest( bytes: &[u8] ) -> Vec<u8> {
    Sha256::digest( bytes ).to_vec()
}


#[derive( Default )]
struct CollectingDevice {
    formats: Arc<Mutex<Vec<PcmFormat>>>,
    written: Arc<Mutex<Vec<u8>>>,
}


struct CollectingLine( Arc<Mutex<Vec<u8>>> );


impl SinkLine for CollectingLine {
    fn write( &mut self, data: &[u8] ) -> Result<(), OutputError> {
        self.0.lock().unwrap().extend_from_slice( data );
        Ok(())
    }


    fn drain( &mut self ) {}
}


impl AudioDevice for CollectingDevice {
    fn open_line( &self, format: PcmFormat ) -> Result<Box<dyn SinkLine>, OutputError> {
        self.formats.lock().unwrap().push( format );
        Ok( Box::new( CollectingLine( Arc::clone( &self.written ) ) ) )
    }
}


#[test]
fn test_songs_served_in_catalog_order() {
    let dir = tempfile::tempdir().unwrap();
    write_wav( &dir.path().join( "second.wav" ), 22_050, 2, 4_000 );
    write_wav( &dir.path().join( "first.wav" ), 8_000, 1, 1_500 );
    fs::write(
        dir.path().join( "songs.csv" ),
        "\"1\",\"First, the song\",\"first.wav\"\r\n\"2\",\"Second\",\"second.wav\"\r\n",
    ).unwrap();

    let catalog = Catalog::load( &dir.path().join( "songs.csv" ) ).unwrap();
    assert_eq!( catalog.names(), vec![ "First, the song", "Second" ] );
    let expected: Vec<Vec<u8>> = catalog.entries().map( |( _, path )| fs::read( path ).unwrap() ).collect();

    let server = StreamServer::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap().with_chunk_size( 700 );
    let port = server.local_addr().unwrap().port();
    let serving = thread::spawn( move || server.serve( &catalog ) );

    for song in &expected {
        let mut received = Vec::new();
        let count = StreamClient::connect( "127.0.0.1", port ).unwrap().receive( &mut received ).unwrap();
        assert_eq!( count as usize, song.len() );
        assert_eq!( digest( &received ), digest( song ) );
    }

    let report = serving.join().unwrap().unwrap();
    let total: usize = expected.iter().map( Vec::len ).sum();
    assert_eq!( report, ServeReport { songs: 2, bytes: total as u64 } );

    // The listener is gone once the catalog is exhausted
    assert!( StreamClient::connect( "127.0.0.1", port ).is_err() );
}


#[test]
fn test_served_song_plays_to_device() {
    let dir = tempfile::tempdir().unwrap();
    let samples = write_wav( &dir.path().join( "tone.wav" ), 16_000, 2, 2_500 );
    fs::write( dir.path().join( "songs.csv" ), "1,Tone,tone.wav\n" ).unwrap();
    let catalog = Catalog::load( &dir.path().join( "songs.csv" ) ).unwrap();

    let server = StreamServer::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap();
    let port = server.local_addr().unwrap().port();
    let serving = thread::spawn( move || server.serve( &catalog ) );

    let device = Arc::new( CollectingDevice::default() );
    let engine = PlaybackEngine::new( Arc::clone( &device ) as Arc<dyn AudioDevice> ).with_block_size( 1_000 );
    let exit = StreamClient::connect( "127.0.0.1", port ).unwrap().play( &engine ).unwrap();
    assert_eq!( exit, LoopExit::Exhausted );

    let expected: Vec<u8> = samples.iter().flat_map( |s| s.to_le_bytes() ).collect();
    assert_eq!( *device.formats.lock().unwrap(), vec![ PcmFormat { sample_rate: 16_000, channels: 2 } ] );
    assert_eq!( digest( &device.written.lock().unwrap() ), digest( &expected ) );

    assert_eq!( serving.join().unwrap().unwrap().songs, 1 );

    // Live streams cannot be replayed
    assert!( engine.resume().is_err() );
}
