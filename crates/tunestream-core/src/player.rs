//! Playback engine
//!
//! The engine decodes a source to normalized PCM and writes it to an audio
//! line from a background thread. Pause and stop are cooperative: they set a
//! cancellation token that the playback loop checks once per block.

use std::io::{ self, Read };
use std::panic::{ self, AssertUnwindSafe };
use std::sync::mpsc::{ self, Receiver, Sender, SyncSender };
use std::sync::atomic::{ AtomicU64, AtomicU8, Ordering };
use std::sync::{ Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock };
use std::thread::{ self, JoinHandle };
use std::time::Duration;

use thiserror::Error;

use crate::decoder::{ DecoderError, PcmFormat, PcmStream, Source };
use crate::output::{ AudioDevice, LineGuard, SinkLine };


/// Bytes moved from the source to the line per loop iteration.
pub const DEFAULT_BLOCK_SIZE: usize = 10_000;


/// Errors that can occur during playback.
#[derive( Debug, Error )]
pub enum PlaybackError {
    #[error( "Failed to open source: {0}" )]
    SourceOpen( #[source] io::Error ),

    #[error( "Unsupported format: {0}" )]
    UnsupportedFormat( String ),

    #[error( "No audio tracks found" )]
    NoAudioTrack,

    #[error( "Decode error: {0}" )]
    Decode( String ),

    #[error( "Audio output unavailable: {0}" )]
    SinkUnavailable( String ),

    #[error( "Audio output error: {0}" )]
    SinkWrite( String ),

    #[error( "Failed to read stream: {0}" )]
    StreamRead( #[source] io::Error ),

    #[error( "Duration not available" )]
    NotAvailable,

    #[error( "No source loaded" )]
    NoSource,

    #[error( "Playback task panicked" )]
    Panicked,
}


impl From<DecoderError> for PlaybackError {
    fn from( err: DecoderError ) -> Self {
        match err {
            DecoderError::SourceOpen( e ) => PlaybackError::SourceOpen( e ),
            DecoderError::UnsupportedFormat( msg ) => PlaybackError::UnsupportedFormat( msg ),
            DecoderError::NoAudioTrack => PlaybackError::NoAudioTrack,
            DecoderError::DecoderCreation( msg ) | DecoderError::Decode( msg ) => PlaybackError::Decode( msg ),
            DecoderError::Read( e ) => PlaybackError::StreamRead( e ),
        }
    }
}


impl PlaybackError {
    /// Classifies an error returned by the source while reading.
    fn from_read( err: io::Error ) -> Self {
        if err.kind() == io::ErrorKind::InvalidData {
            PlaybackError::Decode( err.to_string() )
        } else {
            PlaybackError::StreamRead( err )
        }
    }
}


/// Current playback state.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum PlaybackState {
    Idle,
    Playing,
    PauseRequested,
    ResetRequested,
}


/// Events emitted by the engine.
#[derive( Debug, Clone, PartialEq, Eq )]
pub enum PlaybackEvent {
    Started,
    Paused,
    Reset,
    Finished,
    Failed { message: String },
}


/// Why a playback loop was asked to stop.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum CancelReason {
    Pause,
    Reset,
}


const CANCEL_PAUSE: u8 = 1;
const CANCEL_RESET: u8 = 2;


/// Cancellation flag shared between the engine and one playback task.
#[derive( Debug, Clone, Default )]
pub struct CancelToken {
    flag: Arc<AtomicU8>,
}


impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }


    /// Requests cancellation. A reset request is never downgraded to a pause.
    pub fn cancel( &self, reason: CancelReason ) {
        let value = match reason {
            CancelReason::Pause => CANCEL_PAUSE,
            CancelReason::Reset => CANCEL_RESET,
        };
        self.flag.fetch_max( value, Ordering::AcqRel );
    }


    pub fn reason( &self ) -> Option<CancelReason> {
        match self.flag.load( Ordering::Acquire ) {
            CANCEL_PAUSE => Some( CancelReason::Pause ),
            CANCEL_RESET => Some( CancelReason::Reset ),
            _ => None,
        }
    }


    pub fn is_cancelled( &self ) -> bool {
        self.reason().is_some()
    }
}


/// How a playback loop ended.
#[derive( Debug, Clone, Copy, PartialEq, Eq )]
pub enum LoopExit {
    /// The source reported end of data.
    Exhausted,
    /// The token was observed before the next read.
    Cancelled( CancelReason ),
}


/// Moves `source` into `line` one block at a time.
///
/// The token is checked before every read, so a cancelled loop never reads
/// further input. The line is drained and closed on every exit path.
pub fn play_loop<R: Read + ?Sized>(
    source: &mut R,
    line: Box<dyn SinkLine>,
    token: &CancelToken,
    block_size: usize,
) -> Result<LoopExit, PlaybackError> {
    let mut line = LineGuard::new( line );
    let mut block = vec![ 0u8; block_size.max( 1 ) ];

    loop {
        if let Some( reason ) = token.reason() {
            tracing::debug!( "Playback loop: {:?} requested", reason );
            return Ok( LoopExit::Cancelled( reason ) );
        }

        let count = match source.read( &mut block ) {
            Ok( 0 ) => return Ok( LoopExit::Exhausted ),
            Ok( count ) => count,
            Err( e ) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err( e ) => return Err( PlaybackError::from_read( e ) ),
        };

        line.write( &block[ ..count ] )
            .map_err( |e| PlaybackError::SinkWrite( e.to_string() ) )?;
    }
}


fn lock<T>( mutex: &Mutex<T> ) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else( PoisonError::into_inner )
}


/// Format and length of the current source.
#[derive( Debug, Clone, Copy )]
struct TrackInfo {
    format: PcmFormat,
    n_frames: Option<u64>,
}


/// Generation of the most recently finished playback task.
#[derive( Default )]
struct Completion {
    finished: Mutex<u64>,
    signal: Condvar,
}


impl Completion {
    fn finish( &self, generation: u64 ) {
        let mut finished = lock( &self.finished );
        *finished = ( *finished ).max( generation );
        self.signal.notify_all();
    }


    /// Blocks until the task numbered `generation` has finished.
    fn wait_for( &self, generation: u64 ) {
        let mut finished = lock( &self.finished );
        while *finished < generation {
            finished = self.signal.wait( finished ).unwrap_or_else( PoisonError::into_inner );
        }
    }
}


/// Marks a task finished when dropped, including on unwind.
struct FinishOnDrop {
    completion: Arc<Completion>,
    generation: u64,
}


impl Drop for FinishOnDrop {
    fn drop( &mut self ) {
        self.completion.finish( self.generation );
    }
}


/// The running playback thread.
struct Worker {
    handle: JoinHandle<Result<LoopExit, PlaybackError>>,
    generation: u64,
}


/// State shared between the engine and its playback task.
#[derive( Clone )]
struct Shared {
    state: Arc<RwLock<PlaybackState>>,
    /// Decoded stream waiting to be played; held by the task while it runs
    loaded: Arc<Mutex<Option<PcmStream>>>,
    track: Arc<RwLock<Option<TrackInfo>>>,
    token: Arc<Mutex<CancelToken>>,
    events: Arc<Mutex<Option<Sender<PlaybackEvent>>>>,
    completion: Arc<Completion>,
}


impl Shared {
    fn state( &self ) -> PlaybackState {
        *self.state.read().unwrap_or_else( PoisonError::into_inner )
    }


    fn set_state( &self, state: PlaybackState ) {
        *self.state.write().unwrap_or_else( PoisonError::into_inner ) = state;
    }


    fn set_track( &self, track: Option<TrackInfo> ) {
        *self.track.write().unwrap_or_else( PoisonError::into_inner ) = track;
    }


    fn emit( &self, event: PlaybackEvent ) {
        let mut events = lock( &self.events );
        let disconnected = events.as_ref().is_some_and( |tx| tx.send( event ).is_err() );
        if disconnected {
            *events = None;
        }
    }


    /// Reopens `stream` from its start, or drops it if it is a live stream.
    fn rewound( &self, stream: PcmStream ) -> Option<PcmStream> {
        match stream.rewind() {
            Ok( Some( stream ) ) => Some( stream ),
            Ok( None ) => {
                tracing::info!( "Live stream released" );
                self.set_track( None );
                None
            }
            Err( e ) => {
                tracing::error!( "Failed to rewind source: {}", e );
                self.set_track( None );
                self.emit( PlaybackEvent::Failed { message: e.to_string() } );
                None
            }
        }
    }
}


/// Body of a playback thread.
fn run_task(
    stream: PcmStream,
    device: Arc<dyn AudioDevice>,
    token: CancelToken,
    block_size: usize,
    shared: Shared,
    ready: SyncSender<Result<(), PlaybackError>>,
) -> Result<LoopExit, PlaybackError> {
    let line = match device.open_line( stream.format() ) {
        Ok( line ) => line,
        Err( e ) => {
            let message = e.to_string();
            tracing::error!( "Audio output unavailable: {}", message );
            *lock( &shared.loaded ) = Some( stream );
            shared.set_state( PlaybackState::Idle );
            let _ = ready.send( Err( PlaybackError::SinkUnavailable( message.clone() ) ) );
            return Err( PlaybackError::SinkUnavailable( message ) );
        }
    };

    shared.set_state( PlaybackState::Playing );
    shared.emit( PlaybackEvent::Started );
    let _ = ready.send( Ok(()) );

    let mut stream = stream;
    let result = panic::catch_unwind( AssertUnwindSafe( || {
        play_loop( &mut stream, line, &token, block_size )
    }))
    .unwrap_or_else( |_| Err( PlaybackError::Panicked ) );

    // Parking the stream and leaving Playing happen under the `loaded` lock so
    // a concurrent stop() either reaches the token first or sees Idle.
    let mut loaded = lock( &shared.loaded );
    let event = match ( &result, token.reason() ) {
        ( Err( e ), _ ) => {
            tracing::error!( "Playback failed: {}", e );
            *loaded = shared.rewound( stream );
            PlaybackEvent::Failed { message: e.to_string() }
        }
        ( Ok( LoopExit::Exhausted ), _ ) => {
            tracing::info!( "Playback finished" );
            *loaded = shared.rewound( stream );
            PlaybackEvent::Finished
        }
        ( Ok( LoopExit::Cancelled( _ ) ), Some( CancelReason::Reset ) ) => {
            tracing::info!( "Playback stopped" );
            *loaded = shared.rewound( stream );
            PlaybackEvent::Reset
        }
        ( Ok( LoopExit::Cancelled( _ ) ), _ ) => {
            tracing::info!( "Playback paused" );
            *loaded = Some( stream );
            PlaybackEvent::Paused
        }
    };
    shared.set_state( PlaybackState::Idle );
    drop( loaded );

    shared.emit( event );
    result
}


/// Audio player driving one playback task at a time.
pub struct PlaybackEngine {
    device: Arc<dyn AudioDevice>,
    block_size: usize,
    shared: Shared,
    worker: Mutex<Option<Worker>>,
    generations: AtomicU64,
}


impl PlaybackEngine {
    /// Creates an idle engine writing to `device`.
    pub fn new( device: Arc<dyn AudioDevice> ) -> Self {
        Self {
            device,
            block_size: DEFAULT_BLOCK_SIZE,
            shared: Shared {
                state: Arc::new( RwLock::new( PlaybackState::Idle ) ),
                loaded: Arc::new( Mutex::new( None ) ),
                track: Arc::new( RwLock::new( None ) ),
                token: Arc::new( Mutex::new( CancelToken::new() ) ),
                events: Arc::new( Mutex::new( None ) ),
                completion: Arc::new( Completion::default() ),
            },
            worker: Mutex::new( None ),
            generations: AtomicU64::new( 0 ),
        }
    }


    /// Sets the number of bytes read and written per loop iteration.
    pub fn with_block_size( mut self, block_size: usize ) -> Self {
        self.block_size = block_size.max( 1 );
        self
    }


    /// Returns a receiver for playback events, replacing any earlier one.
    pub fn subscribe( &self ) -> Receiver<PlaybackEvent> {
        let ( tx, rx ) = mpsc::channel();
        *lock( &self.shared.events ) = Some( tx );
        rx
    }


    /// Decodes `source` and starts playing it from the beginning.
    ///
    /// Any active playback is cancelled first, and its line is released
    /// before the new one is opened.
    pub fn play( &self, source: Source ) -> Result<(), PlaybackError> {
        self.load( source )?;
        self.resume()
    }


    /// Decodes `source` and makes it the current stream without playing it.
    pub fn load( &self, source: Source ) -> Result<(), PlaybackError> {
        let mut worker = lock( &self.worker );
        if let Some( previous ) = worker.take() {
            self.shared.token_cancel( CancelReason::Pause );
            Self::join( previous );
        }

        tracing::info!( "Loading: {:?}", source );

        let stream = match PcmStream::open( source ) {
            Ok( stream ) => stream,
            Err( e ) => {
                *lock( &self.shared.loaded ) = None;
                self.shared.set_track( None );
                self.shared.set_state( PlaybackState::Idle );
                return Err( e.into() );
            }
        };

        self.shared.set_track( Some( TrackInfo {
            format: stream.format(),
            n_frames: stream.n_frames(),
        }));
        *lock( &self.shared.loaded ) = Some( stream );
        Ok(())
    }


    /// Plays the current stream from where it was left.
    ///
    /// After `stop()` or natural completion that is the first byte of the
    /// source. Does nothing if already playing.
    pub fn resume( &self ) -> Result<(), PlaybackError> {
        let mut worker = lock( &self.worker );

        if let Some( previous ) = worker.take() {
            if self.shared.state() == PlaybackState::Playing && !previous.handle.is_finished() {
                *worker = Some( previous );
                return Ok(());
            }
            Self::join( previous );
        }

        let stream = lock( &self.shared.loaded ).take().ok_or( PlaybackError::NoSource )?;

        let token = CancelToken::new();
        *lock( &self.shared.token ) = token.clone();

        let ( ready_tx, ready_rx ) = mpsc::sync_channel( 1 );
        let device = Arc::clone( &self.device );
        let shared = self.shared.clone();
        let block_size = self.block_size;
        let generation = self.generations.fetch_add( 1, Ordering::Relaxed ) + 1;

        let handle = thread::Builder::new()
            .name( "tunestream-playback".into() )
            .spawn( move || {
                let _finished = FinishOnDrop { completion: Arc::clone( &shared.completion ), generation };
                run_task( stream, device, token, block_size, shared, ready_tx )
            })
            .map_err( |e| PlaybackError::SinkUnavailable( format!( "failed to spawn playback thread: {}", e ) ) )?;

        match ready_rx.recv() {
            Ok( Ok(()) ) => {
                *worker = Some( Worker { handle, generation } );
                Ok(())
            }
            Ok( Err( e ) ) => {
                let _ = handle.join();
                Err( e )
            }
            Err( _ ) => {
                // The task died before reporting; its join result says why
                match handle.join() {
                    Ok( Err( e ) ) => Err( e ),
                    _ => Err( PlaybackError::Panicked ),
                }
            }
        }
    }


    /// Asks the active task to stop after its current block.
    ///
    /// The decoded stream keeps its position, so `resume()` continues from
    /// there.
    pub fn pause( &self ) {
        let mut state = self.shared.state.write().unwrap_or_else( PoisonError::into_inner );
        if *state == PlaybackState::Playing {
            lock( &self.shared.token ).cancel( CancelReason::Pause );
            *state = PlaybackState::PauseRequested;
            tracing::info!( "Pause requested" );
        }
    }


    /// Stops playback and rebinds the source to its first byte.
    ///
    /// Live streams cannot be rebound and are released instead.
    pub fn stop( &self ) {
        let mut loaded = lock( &self.shared.loaded );
        let mut state = self.shared.state.write().unwrap_or_else( PoisonError::into_inner );

        let current = *state;
        match current {
            PlaybackState::Playing | PlaybackState::PauseRequested => {
                lock( &self.shared.token ).cancel( CancelReason::Reset );
                *state = PlaybackState::ResetRequested;
                tracing::info!( "Stop requested" );
            }
            PlaybackState::ResetRequested => {}
            PlaybackState::Idle => {
                drop( state );
                if let Some( stream ) = loaded.take() {
                    *loaded = self.shared.rewound( stream );
                    tracing::info!( "Stopped" );
                    self.shared.emit( PlaybackEvent::Reset );
                }
            }
        }
    }


    /// Blocks until the active task has finished and returns its outcome.
    ///
    /// Returns `Ok(None)` if there was no task to wait for, or if another
    /// caller collected the task's outcome first.
    pub fn wait( &self ) -> Result<Option<LoopExit>, PlaybackError> {
        let generation = match lock( &self.worker ).as_ref() {
            Some( worker ) => worker.generation,
            None => return Ok( None ),
        };

        // The worker slot stays filled while we block, so load() and resume()
        // can still cancel and join the task themselves.
        self.shared.completion.wait_for( generation );

        let mut slot = lock( &self.worker );
        match slot.take() {
            Some( worker ) if worker.generation == generation => match worker.handle.join() {
                Ok( result ) => result.map( Some ),
                Err( _ ) => Err( PlaybackError::Panicked ),
            },
            other => {
                *slot = other;
                Ok( None )
            }
        }
    }


    /// Gets the current playback state.
    pub fn state( &self ) -> PlaybackState {
        self.shared.state()
    }


    /// Gets the normalized format of the current source.
    pub fn format( &self ) -> Option<PcmFormat> {
        self.shared.track.read().unwrap_or_else( PoisonError::into_inner ).map( |t| t.format )
    }


    /// Gets the total duration of the current source.
    pub fn duration( &self ) -> Result<Duration, PlaybackError> {
        let track = ( *self.shared.track.read().unwrap_or_else( PoisonError::into_inner ) )
            .ok_or( PlaybackError::NotAvailable )?;
        let frames = track.n_frames.ok_or( PlaybackError::NotAvailable )?;
        if track.format.sample_rate == 0 {
            return Err( PlaybackError::NotAvailable );
        }
        Ok( Duration::from_secs_f64( frames as f64 / track.format.sample_rate as f64 ) )
    }


    fn join( worker: Worker ) {
        match worker.handle.join() {
            Ok( Ok( exit ) ) => tracing::debug!( "Previous playback ended: {:?}", exit ),
            Ok( Err( e ) ) => tracing::warn!( "Previous playback failed: {}", e ),
            Err( _ ) => tracing::error!( "Previous playback task panicked" ),
        }
    }
}


impl Shared {
    /// Cancels the current task, moving Playing to PauseRequested.
    fn token_cancel( &self, reason: CancelReason ) {
        let mut state = self.state.write().unwrap_or_else( PoisonError::into_inner );
        lock( &self.token ).cancel( reason );
        if *state == PlaybackState::Playing {
            *state = PlaybackState::PauseRequested;
        }
    }
}


impl Drop for PlaybackEngine {
    fn drop( &mut self ) {
        // Ensure the playback thread is gone before the engine is
        let worker = lock( &self.worker ).take();
        if let Some( worker ) = worker {
            self.shared.token_cancel( CancelReason::Pause );
            Self::join( worker );
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    use crate::decoder::tests::{ le_bytes, ramp, wav_bytes };
    use crate::output::OutputError;


    /// What happened to one opened line.
    #[derive( Debug, Default )]
    struct LineLog {
        writes: Vec<Vec<u8>>,
        drained: bool,
        closed: bool,
    }


    /// Device recording every line it opens, optionally slow.
    #[derive( Default )]
    struct RecordingDevice {
        lines: Arc<Mutex<Vec<Arc<Mutex<LineLog>>>>>,
        write_delay: Duration,
        fail: bool,
    }


    impl RecordingDevice {
        fn slow( write_delay: Duration ) -> Self {
            Self { write_delay, ..Self::default() }
        }


        fn line( &self, index: usize ) -> Arc<Mutex<LineLog>> {
            Arc::clone( &self.lines.lock().unwrap()[ index ] )
        }


        fn line_count( &self ) -> usize {
            self.lines.lock().unwrap().len()
        }


        fn writes( &self, index: usize ) -> usize {
            self.line( index ).lock().unwrap().writes.len()
        }
    }


    struct RecordingLine {
        log: Arc<Mutex<LineLog>>,
        write_delay: Duration,
    }


    impl SinkLine for RecordingLine {
        fn write( &mut self, data: &[u8] ) -> Result<(), OutputError> {
            thread::sleep( self.write_delay );
            self.log.lock().unwrap().writes.push( data.to_vec() );
            Ok(())
        }


        fn drain( &mut self ) {
            self.log.lock().unwrap().drained = true;
        }


        fn close( &mut self ) {
            self.log.lock().unwrap().closed = true;
        }
    }


    impl AudioDevice for RecordingDevice {
        fn open_line( &self, _format: PcmFormat ) -> Result<Box<dyn SinkLine>, OutputError> {
            if self.fail {
                return Err( OutputError::NoDevice );
            }
            let mut lines = self.lines.lock().unwrap();
            if let Some( previous ) = lines.last() {
                assert!( previous.lock().unwrap().closed, "line opened while another is held" );
            }
            let log = Arc::new( Mutex::new( LineLog::default() ) );
            lines.push( Arc::clone( &log ) );
            Ok( Box::new( RecordingLine { log, write_delay: self.write_delay } ) )
        }
    }


    fn engine_with( device: &Arc<RecordingDevice>, block_size: usize ) -> PlaybackEngine {
        let device: Arc<dyn AudioDevice> = Arc::clone( device ) as Arc<dyn AudioDevice>;
        PlaybackEngine::new( device ).with_block_size( block_size )
    }


    fn wait_for( what: &str, mut cond: impl FnMut() -> bool ) {
        let deadline = Instant::now() + Duration::from_secs( 10 );
        while !cond() {
            assert!( Instant::now() < deadline, "timed out waiting for {}", what );
            thread::sleep( Duration::from_millis( 2 ) );
        }
    }


    struct FailingReader;


    impl Read for FailingReader {
        fn read( &mut self, _buf: &mut [u8] ) -> io::Result<usize> {
            Err( io::Error::new( io::ErrorKind::ConnectionReset, "peer went away" ) )
        }
    }


    #[test]
    fn test_cancel_token_reset_wins() {
        let token = CancelToken::new();
        assert_eq!( token.reason(), None );
        token.cancel( CancelReason::Reset );
        token.cancel( CancelReason::Pause );
        assert_eq!( token.reason(), Some( CancelReason::Reset ) );
    }


    #[test]
    fn test_play_loop_copies_in_blocks() {
        let data: Vec<u8> = ( 0..2500u32 ).map( |i| i as u8 ).collect();
        let log = Arc::new( Mutex::new( LineLog::default() ) );
        let line = Box::new( RecordingLine { log: Arc::clone( &log ), write_delay: Duration::ZERO } );

        let exit = play_loop( &mut Cursor::new( data.clone() ), line, &CancelToken::new(), 1000 ).unwrap();
        assert_eq!( exit, LoopExit::Exhausted );

        let log = log.lock().unwrap();
        let sizes: Vec<usize> = log.writes.iter().map( Vec::len ).collect();
        assert_eq!( sizes, vec![ 1000, 1000, 500 ] );
        assert_eq!( log.writes.concat(), data );
        assert!( log.drained && log.closed );
    }


    #[test]
    fn test_play_loop_cancelled_reads_nothing() {
        let log = Arc::new( Mutex::new( LineLog::default() ) );
        let line = Box::new( RecordingLine { log: Arc::clone( &log ), write_delay: Duration::ZERO } );
        let token = CancelToken::new();
        token.cancel( CancelReason::Pause );

        let mut source = Cursor::new( vec![ 1u8; 100 ] );
        let exit = play_loop( &mut source, line, &token, 10 ).unwrap();

        assert_eq!( exit, LoopExit::Cancelled( CancelReason::Pause ) );
        assert_eq!( source.position(), 0 );
        let log = log.lock().unwrap();
        assert!( log.writes.is_empty() );
        assert!( log.drained && log.closed );
    }


    #[test]
    fn test_play_loop_releases_line_on_error() {
        let log = Arc::new( Mutex::new( LineLog::default() ) );
        let line = Box::new( RecordingLine { log: Arc::clone( &log ), write_delay: Duration::ZERO } );

        let err = play_loop( &mut FailingReader, line, &CancelToken::new(), 64 ).unwrap_err();
        assert!( matches!( err, PlaybackError::StreamRead( _ ) ) );

        let log = log.lock().unwrap();
        assert!( log.drained && log.closed );
    }


    #[test]
    fn test_play_to_completion() {
        let device = Arc::new( RecordingDevice::default() );
        let engine = engine_with( &device, 1000 );
        let events = engine.subscribe();
        let samples = ramp( 3000 );

        engine.play( Source::bytes( wav_bytes( 8000, 1, &samples ) ) ).unwrap();
        assert_eq!( engine.wait().unwrap(), Some( LoopExit::Exhausted ) );
        assert_eq!( engine.state(), PlaybackState::Idle );

        let line = device.line( 0 );
        let line = line.lock().unwrap();
        assert_eq!( line.writes.concat(), le_bytes( &samples ) );
        assert!( line.drained && line.closed );

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!( received, vec![ PlaybackEvent::Started, PlaybackEvent::Finished ] );
    }


    #[test]
    fn test_stop_then_resume_restarts_from_first_byte() {
        let device = Arc::new( RecordingDevice::slow( Duration::from_millis( 10 ) ) );
        let engine = engine_with( &device, 400 );
        let samples = ramp( 20_000 );
        let expected = le_bytes( &samples );

        engine.play( Source::bytes( wav_bytes( 8000, 1, &samples ) ) ).unwrap();
        wait_for( "a few blocks", || device.writes( 0 ) >= 3 );

        engine.stop();
        assert!( matches!( engine.state(), PlaybackState::ResetRequested | PlaybackState::Idle ) );
        assert_eq!( engine.wait().unwrap(), Some( LoopExit::Cancelled( CancelReason::Reset ) ) );
        assert_eq!( engine.state(), PlaybackState::Idle );

        engine.resume().unwrap();
        wait_for( "the restarted line", || device.line_count() == 2 && device.writes( 1 ) >= 1 );
        engine.stop();
        engine.wait().unwrap();

        let first = device.line( 0 ).lock().unwrap().writes[ 0 ].clone();
        let restarted = device.line( 1 ).lock().unwrap().writes[ 0 ].clone();
        assert!( !restarted.is_empty() );
        assert_eq!( restarted, first );
        assert!( expected.starts_with( &restarted ) );
    }


    #[test]
    fn test_pause_halts_within_one_block() {
        let device = Arc::new( RecordingDevice::slow( Duration::from_millis( 20 ) ) );
        let engine = engine_with( &device, 200 );
        let samples = ramp( 4_000 );

        engine.play( Source::bytes( wav_bytes( 8000, 1, &samples ) ) ).unwrap();
        wait_for( "a few blocks", || device.writes( 0 ) >= 3 );

        let at_pause = device.writes( 0 );
        let started = Instant::now();
        engine.pause();
        assert_eq!( engine.wait().unwrap(), Some( LoopExit::Cancelled( CancelReason::Pause ) ) );

        assert!( started.elapsed() < Duration::from_millis( 500 ) );
        assert!( device.writes( 0 ) <= at_pause + 1 );
        assert_eq!( engine.state(), PlaybackState::Idle );
    }


    #[test]
    fn test_pause_then_resume_continues() {
        let device = Arc::new( RecordingDevice::slow( Duration::from_millis( 5 ) ) );
        let engine = engine_with( &device, 200 );
        let samples = ramp( 4_000 );

        engine.play( Source::bytes( wav_bytes( 8000, 1, &samples ) ) ).unwrap();
        wait_for( "a few blocks", || device.writes( 0 ) >= 3 );
        engine.pause();
        engine.wait().unwrap();

        engine.resume().unwrap();
        assert_eq!( engine.wait().unwrap(), Some( LoopExit::Exhausted ) );

        let mut played = device.line( 0 ).lock().unwrap().writes.concat();
        played.extend( device.line( 1 ).lock().unwrap().writes.concat() );
        assert_eq!( played, le_bytes( &samples ) );
    }


    #[test]
    fn test_stop_while_paused_rewinds() {
        let device = Arc::new( RecordingDevice::slow( Duration::from_millis( 5 ) ) );
        let engine = engine_with( &device, 200 );
        let samples = ramp( 4_000 );

        engine.play( Source::bytes( wav_bytes( 8000, 1, &samples ) ) ).unwrap();
        wait_for( "a few blocks", || device.writes( 0 ) >= 3 );
        engine.pause();
        engine.wait().unwrap();

        engine.stop();
        engine.resume().unwrap();
        engine.wait().unwrap();

        let replayed = device.line( 1 ).lock().unwrap().writes.concat();
        assert_eq!( replayed, le_bytes( &samples ) );
    }


    #[test]
    fn test_play_while_playing_releases_previous_line() {
        let device = Arc::new( RecordingDevice::slow( Duration::from_millis( 10 ) ) );
        let engine = engine_with( &device, 200 );
        let first = ramp( 20_000 );
        let second = ramp( 500 );

        engine.play( Source::bytes( wav_bytes( 8000, 1, &first ) ) ).unwrap();
        wait_for( "first playback", || device.writes( 0 ) >= 1 );

        engine.play( Source::bytes( wav_bytes( 8000, 1, &second ) ) ).unwrap();
        engine.wait().unwrap();

        assert_eq!( device.line_count(), 2 );
        assert!( device.line( 0 ).lock().unwrap().closed );
        assert_eq!( device.line( 1 ).lock().unwrap().writes.concat(), le_bytes( &second ) );
    }


    #[test]
    fn test_live_stream_is_released_on_completion() {
        let device = Arc::new( RecordingDevice::default() );
        let engine = engine_with( &device, 1000 );
        let samples = ramp( 1000 );

        engine.play( Source::stream( Cursor::new( wav_bytes( 8000, 2, &samples ) ) ) ).unwrap();
        engine.wait().unwrap();

        assert!( matches!( engine.resume(), Err( PlaybackError::NoSource ) ) );
        assert!( matches!( engine.duration(), Err( PlaybackError::NotAvailable ) ) );
    }


    #[test]
    fn test_sink_unavailable_leaves_engine_idle() {
        let device = Arc::new( RecordingDevice { fail: true, ..RecordingDevice::default() } );
        let engine = engine_with( &device, 1000 );

        let result = engine.play( Source::bytes( wav_bytes( 8000, 1, &ramp( 100 ) ) ) );
        assert!( matches!( result, Err( PlaybackError::SinkUnavailable( _ ) ) ) );
        assert_eq!( engine.state(), PlaybackState::Idle );
    }


    #[test]
    fn test_decode_failures_are_reported() {
        let device = Arc::new( RecordingDevice::default() );
        let engine = engine_with( &device, 1000 );

        let result = engine.play( Source::bytes( vec![ 0x5au8; 4096 ] ) );
        assert!( matches!( result, Err( PlaybackError::UnsupportedFormat( _ ) ) ) );
        assert_eq!( engine.state(), PlaybackState::Idle );

        let result = engine.play( Source::file( "/no/such/song.wav" ) );
        assert!( matches!( result, Err( PlaybackError::SourceOpen( _ ) ) ) );
        assert_eq!( engine.state(), PlaybackState::Idle );
        assert_eq!( device.line_count(), 0 );
    }


    /// Device whose lines panic on the first write.
    #[derive( Default )]
    struct PanickingDevice {
        opened: AtomicUsize,
    }


    struct PanickingLine;


    impl SinkLine for PanickingLine {
        fn write( &mut self, _data: &[u8] ) -> Result<(), OutputError> {
            panic!( "sink exploded" );
        }


        fn drain( &mut self ) {}
    }


    impl AudioDevice for PanickingDevice {
        fn open_line( &self, _format: PcmFormat ) -> Result<Box<dyn SinkLine>, OutputError> {
            self.opened.fetch_add( 1, Ordering::SeqCst );
            Ok( Box::new( PanickingLine ) )
        }
    }


    #[test]
    fn test_panicking_sink_leaves_engine_idle() {
        let device = Arc::new( PanickingDevice::default() );
        let engine = PlaybackEngine::new( Arc::clone( &device ) as Arc<dyn AudioDevice> ).with_block_size( 256 );
        let events = engine.subscribe();

        engine.play( Source::bytes( wav_bytes( 8000, 1, &ramp( 1000 ) ) ) ).unwrap();
        assert!( matches!( engine.wait(), Err( PlaybackError::Panicked ) ) );
        assert_eq!( engine.state(), PlaybackState::Idle );

        let received: Vec<_> = events.try_iter().collect();
        assert_eq!( received.first(), Some( &PlaybackEvent::Started ) );
        assert!( matches!( received.last(), Some( PlaybackEvent::Failed { .. } ) ) );

        // The source was parked and rewound, so it can be played again
        engine.resume().unwrap();
        assert!( matches!( engine.wait(), Err( PlaybackError::Panicked ) ) );
        assert_eq!( device.opened.load( Ordering::SeqCst ), 2 );
        assert_eq!( engine.state(), PlaybackState::Idle );
    }


    #[test]
    fn test_wait_returns_once_per_task() {
        let device = Arc::new( RecordingDevice::slow( Duration::from_millis( 2 ) ) );
        let engine = Arc::new( engine_with( &device, 500 ) );
        engine.play( Source::bytes( wav_bytes( 8000, 1, &ramp( 4_000 ) ) ) ).unwrap();

        let waiter = {
            let engine = Arc::clone( &engine );
            thread::spawn( move || engine.wait() )
        };
        let here = engine.wait();
        let there = waiter.join().unwrap();

        // Exactly one caller collects the outcome; the other sees no task
        let outcomes = [ here.unwrap(), there.unwrap() ];
        assert!( outcomes.contains( &Some( LoopExit::Exhausted ) ) );
        assert!( outcomes.contains( &None ) );
        assert!( matches!( engine.wait(), Ok( None ) ) );
    }


    #[test]
    fn test_resume_without_source() {
        let engine = engine_with( &Arc::new( RecordingDevice::default() ), 1000 );
        assert!( matches!( engine.resume(), Err( PlaybackError::NoSource ) ) );
        assert!( matches!( engine.wait(), Ok( None ) ) );
    }


    #[test]
    fn test_duration() {
        let engine = engine_with( &Arc::new( RecordingDevice::default() ), 1000 );
        assert!( matches!( engine.duration(), Err( PlaybackError::NotAvailable ) ) );

        engine.load( Source::bytes( wav_bytes( 16000, 2, &vec![ 0i16; 48_000 ] ) ) ).unwrap();
        assert_eq!( engine.duration().unwrap(), Duration::from_millis( 1500 ) );
        assert_eq!( engine.format(), Some( PcmFormat { sample_rate: 16000, channels: 2 } ) );
    }
}
