//! Jukebox stream client
//!
//! Connects to a stream server and consumes the one song it is handed, either
//! by playing it through a `PlaybackEngine` or by copying the raw bytes out.

use std::io::{ self, BufReader, Write };
use std::net::{ SocketAddr, TcpStream };

use thiserror::Error;

use crate::decoder::Source;
use crate::player::{ LoopExit, PlaybackEngine, PlaybackError };


/// Errors that can occur while receiving a song.
#[derive( Debug, Error )]
pub enum ClientError {
    #[error( "Failed to connect to {addr}: {source}" )]
    Connection {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error( "Failed to read stream: {0}" )]
    StreamRead( #[source] io::Error ),

    #[error( transparent )]
    Playback( PlaybackError ),
}


impl From<PlaybackError> for ClientError {
    fn from( err: PlaybackError ) -> Self {
        match err {
            PlaybackError::StreamRead( e ) => ClientError::StreamRead( e ),
            other => ClientError::Playback( other ),
        }
    }
}


/// An open connection to a stream server.
#[derive( Debug )]
pub struct StreamClient {
    stream: TcpStream,
    peer: SocketAddr,
}


impl StreamClient {
    /// Connects to `host:port`.
    pub fn connect( host: &str, port: u16 ) -> Result<Self, ClientError> {
        let connection_error = |source| ClientError::Connection {
            addr: format!( "{}:{}", host, port ),
            source,
        };

        let stream = TcpStream::connect( ( host, port ) ).map_err( connection_error )?;
        let peer = stream.peer_addr().map_err( connection_error )?;

        tracing::info!( "Connected to {}", peer );
        Ok( Self { stream, peer } )
    }


    /// Returns the server's address.
    pub fn peer_addr( &self ) -> SocketAddr {
        self.peer
    }


    /// Plays the received song on `engine` and blocks until playback ends.
    ///
    /// The connection is owned by the engine from here on and is closed when
    /// the engine releases the stream.
    pub fn play( self, engine: &PlaybackEngine ) -> Result<LoopExit, ClientError> {
        tracing::info!( "Playing stream from {}", self.peer );

        engine.play( Source::stream( BufReader::new( self.stream ) ) )?;
        let exit = engine.wait()?.ok_or( PlaybackError::NoSource )?;

        tracing::info!( "Stream from {} ended: {:?}", self.peer, exit );
        Ok( exit )
    }


    /// Copies the raw song bytes into `writer` without decoding them.
    pub fn receive<W: Write + ?Sized>( mut self, writer: &mut W ) -> Result<u64, ClientError> {
        let bytes = io::copy( &mut self.stream, writer ).map_err( ClientError::StreamRead )?;
        writer.flush().map_err( ClientError::StreamRead )?;

        tracing::info!( "Received {} bytes from {}", bytes, self.peer );
        Ok( bytes )
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::io::Read;
    use std::net::{ Ipv4Addr, TcpListener };
    use std::sync::{ Arc, Mutex };
    use std::thread;

    use crate::decoder::tests::{ le_bytes, ramp, wav_bytes };
    use crate::output::{ AudioDevice, OutputError, SinkLine };
    use crate::decoder::PcmFormat;


    /// Collects everything written to any line it opens.
    #[derive( Default )]
    struct CollectingDevice {
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
        fn open_line( &self, _format: PcmFormat ) -> Result<Box<dyn SinkLine>, OutputError> {
            Ok( Box::new( CollectingLine( Arc::clone( &self.written ) ) ) )
        }
    }


    /// Serves `payload` to the first peer, then closes.
    fn one_shot_server( payload: Vec<u8> ) -> ( u16, thread::JoinHandle<()> ) {
        let listener = TcpListener::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn( move || {
            let ( mut peer, _ ) = listener.accept().unwrap();
            peer.write_all( &payload ).unwrap();
        });
        ( port, handle )
    }


    #[test]
    fn test_connection_refused() {
        let listener = TcpListener::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap();
        let port = listener.local_addr().unwrap().port();
        drop( listener );

        let result = StreamClient::connect( "127.0.0.1", port );
        assert!( matches!( result, Err( ClientError::Connection { .. } ) ) );
    }


    #[test]
    fn test_receive_copies_raw_bytes() {
        let payload: Vec<u8> = ( 0..5000u32 ).map( |i| ( i * 7 ) as u8 ).collect();
        let ( port, server ) = one_shot_server( payload.clone() );

        let client = StreamClient::connect( "127.0.0.1", port ).unwrap();
        let mut out = Vec::new();
        assert_eq!( client.receive( &mut out ).unwrap(), 5000 );
        assert_eq!( out, payload );
        server.join().unwrap();
    }


    #[test]
    fn test_play_decodes_stream() {
        let samples = ramp( 3000 );
        let ( port, server ) = one_shot_server( wav_bytes( 8000, 1, &samples ) );

        let device = Arc::new( CollectingDevice::default() );
        let engine = PlaybackEngine::new( Arc::clone( &device ) as Arc<dyn AudioDevice> ).with_block_size( 512 );

        let exit = StreamClient::connect( "127.0.0.1", port ).unwrap().play( &engine ).unwrap();
        assert_eq!( exit, LoopExit::Exhausted );
        assert_eq!( *device.written.lock().unwrap(), le_bytes( &samples ) );
        server.join().unwrap();
    }


    #[test]
    fn test_play_closes_connection_when_done() {
        let listener = TcpListener::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap();
        let port = listener.local_addr().unwrap().port();
        let payload = wav_bytes( 8000, 1, &ramp( 100 ) );
        let server = thread::spawn( move || {
            let ( mut peer, _ ) = listener.accept().unwrap();
            peer.write_all( &payload ).unwrap();
            peer.shutdown( std::net::Shutdown::Write ).unwrap();
            // Returns once the client hangs up, by FIN or by reset
            let mut rest = Vec::new();
            let _ = peer.read_to_end( &mut rest );
            rest
        });

        let engine = PlaybackEngine::new( Arc::new( CollectingDevice::default() ) );
        StreamClient::connect( "127.0.0.1", port ).unwrap().play( &engine ).unwrap();
        assert!( server.join().unwrap().is_empty() );
    }


    #[test]
    fn test_reset_mid_stream_is_stream_read_error() {
        let listener = TcpListener::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap();
        let port = listener.local_addr().unwrap().port();
        let song = wav_bytes( 8000, 1, &ramp( 50_000 ) );
        let server = thread::spawn( move || {
            let ( mut peer, _ ) = listener.accept().unwrap();
            peer.write_all( &song[ ..20_000 ] ).unwrap();
            // Closing with unread input makes the kernel reset the connection
            let mut byte = [ 0u8; 1 ];
            peer.peek( &mut byte ).unwrap();
        });

        let mut client = StreamClient::connect( "127.0.0.1", port ).unwrap();
        client.stream.write_all( b"x" ).unwrap();
        server.join().unwrap();

        let engine = PlaybackEngine::new( Arc::new( CollectingDevice::default() ) );
        let result = client.play( &engine );
        assert!( matches!( result, Err( ClientError::StreamRead( _ ) ) ), "got {:?}", result );
        assert_eq!( engine.state(), crate::player::PlaybackState::Idle );
    }


    #[test]
    fn test_playback_errors_keep_their_kind() {
        let reset = io::Error::new( io::ErrorKind::ConnectionReset, "reset" );
        assert!( matches!( ClientError::from( PlaybackError::StreamRead( reset ) ), ClientError::StreamRead( _ ) ) );
        assert!( matches!( ClientError::from( PlaybackError::NoAudioTrack ), ClientError::Playback( PlaybackError::NoAudioTrack ) ) );
    }


    #[test]
    fn test_garbage_stream_is_playback_error() {
        let ( port, server ) = one_shot_server( vec![ 0x5a; 4096 ] );

        let engine = PlaybackEngine::new( Arc::new( CollectingDevice::default() ) );
        let result = StreamClient::connect( "127.0.0.1", port ).unwrap().play( &engine );
        assert!( matches!( result, Err( ClientError::Playback( _ ) ) ) );
        server.join().unwrap();
    }
}
