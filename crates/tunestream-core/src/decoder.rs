//! Audio decoding via Symphonia
//!
//! Probes a source's container, decodes its first audio track, and normalizes
//! every packet to interleaved 16-bit signed little-endian PCM. The normalized
//! bytes are exposed through `std::io::Read`.

use std::fmt;
use std::fs::File;
use std::io::{ self, Cursor, Read };
use std::path::PathBuf;
use std::sync::Arc;

use symphonia::core::audio::{ SampleBuffer, SignalSpec };
use symphonia::core::codecs::{ Decoder as SymphoniaDecoder, DecoderOptions, CODEC_TYPE_NULL };
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{ FormatOptions, FormatReader };
use symphonia::core::io::{ MediaSource, MediaSourceStream, MediaSourceStreamOptions, ReadOnlySource };
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use thiserror::Error;


/// Read-ahead buffer for the media source stream.
const SOURCE_BUFFER_LEN: usize = 64 * 1024;


/// Errors that can occur during decoding.
#[derive( Debug, Error )]
pub enum DecoderError {
    #[error( "Failed to open source: {0}" )]
    SourceOpen( #[source] io::Error ),

    #[error( "Unsupported format: {0}" )]
    UnsupportedFormat( String ),

    #[error( "No audio tracks found" )]
    NoAudioTrack,

    #[error( "Decoder creation failed: {0}" )]
    DecoderCreation( String ),

    #[error( "Failed to read source: {0}" )]
    Read( #[source] io::Error ),

    #[error( "Decode error: {0}" )]
    Decode( String ),
}


impl From<DecoderError> for io::Error {
    fn from( err: DecoderError ) -> Self {
        match err {
            DecoderError::Read( e ) | DecoderError::SourceOpen( e ) => e,
            other => io::Error::new( io::ErrorKind::InvalidData, other ),
        }
    }
}


/// Origin of audio bytes handed to the playback engine.
pub enum Source {
    /// A local file; reopened from the start on rewind.
    File( PathBuf ),

    /// An in-memory buffer; rewindable.
    Bytes( Arc<[u8]> ),

    /// A live byte stream such as a network socket; cannot be rewound.
    Stream( Box<dyn Read + Send + Sync> ),
}


impl Source {
    pub fn file( path: impl Into<PathBuf> ) -> Self {
        Source::File( path.into() )
    }


    pub fn bytes( data: impl Into<Arc<[u8]>> ) -> Self {
        Source::Bytes( data.into() )
    }


    pub fn stream<R: Read + Send + Sync + 'static>( reader: R ) -> Self {
        Source::Stream( Box::new( reader ) )
    }


    /// Returns true if the source can be reopened from its first byte.
    pub fn is_rewindable( &self ) -> bool {
        !matches!( self, Source::Stream( _ ) )
    }
}


impl fmt::Debug for Source {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        match self {
            Source::File( path ) => f.debug_tuple( "File" ).field( path ).finish(),
            Source::Bytes( data ) => write!( f, "Bytes({} bytes)", data.len() ),
            Source::Stream( _ ) => f.write_str( "Stream" ),
        }
    }
}


/// What a decoded stream was opened from, kept so it can be reopened.
enum Origin {
    File( PathBuf ),
    Bytes( Arc<[u8]> ),
    Stream,
}


impl Origin {
    fn reopen( &self ) -> Option<Source> {
        match self {
            Origin::File( path ) => Some( Source::File( path.clone() ) ),
            Origin::Bytes( data ) => Some( Source::Bytes( Arc::clone( data ) ) ),
            Origin::Stream => None,
        }
    }
}


/// Normalized output format: interleaved signed 16-bit little-endian PCM.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub struct PcmFormat {
    pub sample_rate: u32,
    pub channels: u16,
}


impl PcmFormat {
    pub const BITS_PER_SAMPLE: u16 = 16;


    /// Bytes per frame (one sample for every channel).
    pub fn frame_size( &self ) -> usize {
        self.channels as usize * ( Self::BITS_PER_SAMPLE as usize / 8 )
    }


    pub fn bytes_per_second( &self ) -> usize {
        self.frame_size() * self.sample_rate as usize
    }
}


/// Decoded, normalized view of a source.
pub struct PcmStream {
    origin: Origin,
    format_reader: Box<dyn FormatReader>,
    decoder: Box<dyn SymphoniaDecoder>,
    track_id: u32,
    format: PcmFormat,
    /// Set once a decoded buffer has confirmed `format`
    format_settled: bool,
    n_frames: Option<u64>,
    sample_buf: Option<( SignalSpec, SampleBuffer<i16> )>,
    pending: Vec<u8>,
    pending_pos: usize,
    finished: bool,
}


impl PcmStream {
    /// Opens and probes a source.
    ///
    /// The container is detected from the content; a file extension is only
    /// passed along as a hint.
    pub fn open( source: Source ) -> Result<Self, DecoderError> {
        let mut hint = Hint::new();

        let ( media, origin ): ( Box<dyn MediaSource>, Origin ) = match source {
            Source::File( path ) => {
                let file = File::open( &path ).map_err( DecoderError::SourceOpen )?;
                if let Some( ext ) = path.extension().and_then( |e| e.to_str() ) {
                    hint.with_extension( ext );
                }
                ( Box::new( file ), Origin::File( path ) )
            }
            Source::Bytes( data ) => {
                ( Box::new( Cursor::new( Arc::clone( &data ) ) ), Origin::Bytes( data ) )
            }
            Source::Stream( reader ) => {
                ( Box::new( ReadOnlySource::new( reader ) ), Origin::Stream )
            }
        };

        let mss_opts = MediaSourceStreamOptions { buffer_len: SOURCE_BUFFER_LEN };
        let mss = MediaSourceStream::new( media, mss_opts );

        let probed = symphonia::default::get_probe()
            .format( &hint, mss, &FormatOptions::default(), &MetadataOptions::default() )
            .map_err( |e| match e {
                SymphoniaError::IoError( io ) if io.kind() != io::ErrorKind::UnexpectedEof => {
                    DecoderError::Read( io )
                }
                other => DecoderError::UnsupportedFormat( other.to_string() ),
            })?;

        let format_reader = probed.format;

        let track = format_reader
            .tracks()
            .iter()
            .find( |t| t.codec_params.codec != CODEC_TYPE_NULL )
            .ok_or( DecoderError::NoAudioTrack )?;

        let track_id = track.id;
        let codec_params = &track.codec_params;

        let declared = match ( codec_params.sample_rate, codec_params.channels ) {
            ( Some( sample_rate ), Some( channels ) ) => Some( PcmFormat {
                sample_rate,
                channels: channels.count() as u16,
            }),
            _ => None,
        };
        let n_frames = codec_params.n_frames;

        let decoder = symphonia::default::get_codecs()
            .make( codec_params, &DecoderOptions::default() )
            .map_err( |e| DecoderError::DecoderCreation( e.to_string() ) )?;

        let mut stream = Self {
            origin,
            format_reader,
            decoder,
            track_id,
            format: declared.unwrap_or( PcmFormat { sample_rate: 0, channels: 0 } ),
            format_settled: false,
            n_frames,
            sample_buf: None,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        };

        // The first decoded buffer is the authority on the output layout
        stream.decode_next()?;
        if !stream.format_settled && declared.is_none() {
            return Err( DecoderError::NoAudioTrack );
        }

        tracing::info!(
            "Opened audio: {} Hz, {} channels, {:?} frames",
            stream.format.sample_rate,
            stream.format.channels,
            n_frames
        );

        Ok( stream )
    }


    /// Returns the normalized output format.
    pub fn format( &self ) -> PcmFormat {
        self.format
    }


    /// Returns the total length in frames, if the container reports it.
    pub fn n_frames( &self ) -> Option<u64> {
        self.n_frames
    }


    /// Returns the duration in seconds, if known.
    pub fn duration( &self ) -> Option<f64> {
        self.n_frames.map( |frames| frames as f64 / self.format.sample_rate as f64 )
    }


    /// Returns true if `rewind` can restart this stream.
    pub fn is_rewindable( &self ) -> bool {
        !matches!( self.origin, Origin::Stream )
    }


    /// Reopens the underlying source from its first byte.
    ///
    /// Returns `Ok(None)` for live streams, which are dropped instead.
    pub fn rewind( self ) -> Result<Option<Self>, DecoderError> {
        match self.origin.reopen() {
            Some( source ) => {
                drop( self );
                Self::open( source ).map( Some )
            }
            None => Ok( None ),
        }
    }


    /// Decodes packets until at least one normalized sample is pending, or
    /// the end of the track is reached.
    fn decode_next( &mut self ) -> Result<(), DecoderError> {
        loop {
            let packet = match self.format_reader.next_packet() {
                Ok( packet ) => packet,
                Err( SymphoniaError::IoError( ref e ) ) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.finished = true;
                    return Ok(());
                }
                Err( SymphoniaError::ResetRequired ) => {
                    tracing::warn!( "Stream parameters changed mid-track, ending playback" );
                    self.finished = true;
                    return Ok(());
                }
                Err( SymphoniaError::IoError( e ) ) => return Err( DecoderError::Read( e ) ),
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode( &packet ) {
                Ok( decoded ) => decoded,
                Err( SymphoniaError::DecodeError( e ) ) => {
                    // Corrupt packets are skipped
                    tracing::debug!( "Skipping undecodable packet: {}", e );
                    continue;
                }
                Err( e ) => return Err( DecoderError::Decode( e.to_string() ) ),
            };

            if decoded.frames() == 0 {
                continue;
            }

            let spec = *decoded.spec();
            let decoded_format = PcmFormat {
                sample_rate: spec.rate,
                channels: spec.channels.count() as u16,
            };
            let settled = self.format_settled.then_some( self.format );
            self.format = settle_format( settled, decoded_format )?;
            self.format_settled = true;

            let capacity = decoded.capacity() as u64;
            let reuse = matches!(
                &self.sample_buf,
                Some(( s, buf )) if *s == spec && buf.capacity() >= decoded.capacity() * spec.channels.count()
            );
            if !reuse {
                self.sample_buf = Some(( spec, SampleBuffer::new( capacity, spec ) ));
            }

            let Some(( _, sample_buf )) = self.sample_buf.as_mut() else {
                continue;
            };
            sample_buf.copy_interleaved_ref( decoded );

            self.pending.clear();
            self.pending_pos = 0;
            self.pending.reserve( sample_buf.samples().len() * 2 );
            for sample in sample_buf.samples() {
                self.pending.extend_from_slice( &sample.to_le_bytes() );
            }
            return Ok(());
        }
    }
}


/// Checks a decoded buffer's layout against the one the stream settled on.
///
/// The first buffer settles the layout. A later change cannot be followed
/// because the output line is already open in the settled format.
fn settle_format( settled: Option<PcmFormat>, decoded: PcmFormat ) -> Result<PcmFormat, DecoderError> {
    match settled {
        None => Ok( decoded ),
        Some( format ) if format == decoded => Ok( format ),
        Some( format ) => Err( DecoderError::Decode( format!(
            "layout changed mid-track from {} Hz/{} ch to {} Hz/{} ch",
            format.sample_rate,
            format.channels,
            decoded.sample_rate,
            decoded.channels
        ))),
    }
}


impl Read for PcmStream {
    fn read( &mut self, buf: &mut [u8] ) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok( 0 );
        }

        while self.pending_pos >= self.pending.len() {
            if self.finished {
                return Ok( 0 );
            }
            self.decode_next()?;
        }

        let available = &self.pending[ self.pending_pos.. ];
        let n = available.len().min( buf.len() );
        buf[ ..n ].copy_from_slice( &available[ ..n ] );
        self.pending_pos += n;
        Ok( n )
    }
}


impl fmt::Debug for PcmStream {
    fn fmt( &self, f: &mut fmt::Formatter<'_> ) -> fmt::Result {
        f.debug_struct( "PcmStream" )
            .field( "format", &self.format )
            .field( "n_frames", &self.n_frames )
            .field( "rewindable", &self.is_rewindable() )
            .finish()
    }
}


#[cfg( test )]
pub(crate) mod tests {
    use super::*;


    /// Builds an in-memory 16-bit PCM WAV file.
    pub(crate) fn wav_bytes( sample_rate: u32, channels: u16, samples: &[i16] ) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new( Vec::new() );
        {
            let mut writer = hound::WavWriter::new( &mut cursor, spec ).unwrap();
            for &s in samples {
                writer.write_sample( s ).unwrap();
            }
            writer.finalize().unwrap();
        }
        cursor.into_inner()
    }


    pub(crate) fn le_bytes( samples: &[i16] ) -> Vec<u8> {
        samples.iter().flat_map( |s| s.to_le_bytes() ).collect()
    }


    pub(crate) fn ramp( len: usize ) -> Vec<i16> {
        ( 0..len ).map( |i| ( ( i * 37 ) % 65536 ) as i32 as i16 ).collect()
    }


    #[test]
    fn test_pcm_wav_passes_through_normalization() {
        let samples = ramp( 4000 );
        let mut stream = PcmStream::open( Source::bytes( wav_bytes( 8000, 2, &samples ) ) ).unwrap();

        assert_eq!( stream.format(), PcmFormat { sample_rate: 8000, channels: 2 } );
        assert_eq!( stream.n_frames(), Some( 2000 ) );

        let mut out = Vec::new();
        stream.read_to_end( &mut out ).unwrap();
        assert_eq!( out, le_bytes( &samples ) );
    }


    #[test]
    fn test_24_bit_wav_is_converted_to_16_bit() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 22050,
            bits_per_sample: 24,
            sample_format: hound::SampleFormat::Int,
        };
        let input: Vec<i32> = vec![ 0x12_3456, -0x40_0000, 0x7f_ff00, 0 ];
        let mut cursor = Cursor::new( Vec::new() );
        {
            let mut writer = hound::WavWriter::new( &mut cursor, spec ).unwrap();
            for &s in &input {
                writer.write_sample( s ).unwrap();
            }
            writer.finalize().unwrap();
        }

        let mut stream = PcmStream::open( Source::bytes( cursor.into_inner() ) ).unwrap();
        let mut out = Vec::new();
        stream.read_to_end( &mut out ).unwrap();

        let expected: Vec<i16> = input.iter().map( |s| ( s >> 8 ) as i16 ).collect();
        assert_eq!( out, le_bytes( &expected ) );
    }


    #[test]
    fn test_duration() {
        let samples = vec![ 0i16; 44100 ];
        let stream = PcmStream::open( Source::bytes( wav_bytes( 22050, 1, &samples ) ) ).unwrap();
        assert_eq!( stream.duration(), Some( 2.0 ) );
    }


    #[test]
    fn test_stream_source_decodes_and_is_not_rewindable() {
        let samples = ramp( 500 );
        let reader = Cursor::new( wav_bytes( 16000, 1, &samples ) );
        let mut stream = PcmStream::open( Source::stream( reader ) ).unwrap();
        assert!( !stream.is_rewindable() );

        let mut out = Vec::new();
        stream.read_to_end( &mut out ).unwrap();
        assert_eq!( out, le_bytes( &samples ) );

        assert!( stream.rewind().unwrap().is_none() );
    }


    #[test]
    fn test_rewind_restarts_from_first_byte() {
        let samples = ramp( 3000 );
        let mut stream = PcmStream::open( Source::bytes( wav_bytes( 8000, 1, &samples ) ) ).unwrap();

        let mut head = [ 0u8; 1000 ];
        stream.read_exact( &mut head ).unwrap();

        let mut stream = stream.rewind().unwrap().unwrap();
        let mut out = Vec::new();
        stream.read_to_end( &mut out ).unwrap();
        assert_eq!( out, le_bytes( &samples ) );
    }


    #[test]
    fn test_open_primes_first_buffer() {
        let samples = ramp( 600 );
        let stream = PcmStream::open( Source::bytes( wav_bytes( 11025, 1, &samples ) ) ).unwrap();

        assert!( stream.format_settled );
        assert!( !stream.pending.is_empty() );
        assert_eq!( stream.format(), PcmFormat { sample_rate: 11025, channels: 1 } );
    }


    #[test]
    fn test_settle_format() {
        let stereo = PcmFormat { sample_rate: 44100, channels: 2 };
        let mono = PcmFormat { sample_rate: 44100, channels: 1 };

        assert_eq!( settle_format( None, mono ).unwrap(), mono );
        assert_eq!( settle_format( Some( stereo ), stereo ).unwrap(), stereo );
        assert!( matches!( settle_format( Some( stereo ), mono ), Err( DecoderError::Decode( _ ) ) ) );
    }


    #[test]
    fn test_empty_track_keeps_declared_format() {
        let mut stream = PcmStream::open( Source::bytes( wav_bytes( 8000, 2, &[] ) ) ).unwrap();
        assert_eq!( stream.format(), PcmFormat { sample_rate: 8000, channels: 2 } );

        let mut out = Vec::new();
        stream.read_to_end( &mut out ).unwrap();
        assert!( out.is_empty() );
    }


    #[test]
    fn test_missing_file() {
        let err = PcmStream::open( Source::file( "/definitely/not/here.wav" ) ).unwrap_err();
        assert!( matches!( err, DecoderError::SourceOpen( _ ) ) );
    }


    #[test]
    fn test_garbage_is_unsupported() {
        let err = PcmStream::open( Source::bytes( vec![ 0x5au8; 4096 ] ) ).unwrap_err();
        assert!( matches!( err, DecoderError::UnsupportedFormat( _ ) ) );
    }
}
