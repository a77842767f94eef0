//! Tunestream CLI - Network jukebox server and client

mod cli;
mod settings;

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{ Context, Result };
use clap::Parser;
use tracing_subscriber::{ layer::SubscriberExt, util::SubscriberInitExt };

use cli::{ Args, Mode };
use settings::Settings;

use tunestream_core::{
    Catalog, CpalDevice, LoopExit, PlaybackEngine, Source, StreamClient, StreamServer,
};


fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else( |_| "tunestream_cli=info,tunestream_core=info".into() ),
        )
        .with( tracing_subscriber::fmt::layer().with_writer( std::io::stderr ) )
        .init();
}


fn main() -> ExitCode {
    let args = Args::parse();
    init_logging();

    match run( args.command, Settings::load() ) {
        Ok(()) => ExitCode::SUCCESS,
        Err( e ) => {
            eprintln!( "error: {:#}", e );
            ExitCode::FAILURE
        }
    }
}


fn run( mode: Mode, settings: Settings ) -> Result<()> {
    match mode {
        Mode::Server { catalog, port, chunk_size } => {
            let catalog = Catalog::load( &catalog )
                .with_context( || format!( "Cannot serve {}", catalog.display() ) )?;

            let server = StreamServer::bind( ( settings.bind_host.as_str(), port ) )?
                .with_chunk_size( chunk_size.unwrap_or( settings.chunk_size ) );
            let report = server.serve( &catalog )?;

            println!( "Served {} songs ({} bytes)", report.songs, report.bytes );
        }

        Mode::Client { host, port, block_size, save } => {
            let client = StreamClient::connect( &host, port )?;

            match save {
                Some( path ) => {
                    let file = File::create( &path )
                        .with_context( || format!( "Cannot create {}", path.display() ) )?;
                    let bytes = client.receive( &mut BufWriter::new( file ) )?;
                    println!( "Saved {} bytes to {}", bytes, path.display() );
                }
                None => {
                    let engine = engine( &settings, block_size );
                    let exit = client.play( &engine ).context( "Stream playback failed" )?;
                    report_exit( exit );
                }
            }
        }

        Mode::Play { file, block_size } => {
            play_file( &file, &engine( &settings, block_size ) )
                .with_context( || format!( "Cannot play {}", file.display() ) )?;
        }

        Mode::List { catalog } => {
            let catalog = Catalog::load( &catalog )
                .with_context( || format!( "Cannot list {}", catalog.display() ) )?;
            for ( index, ( name, path ) ) in catalog.entries().enumerate() {
                println!( "{:>3}  {}  {}", index + 1, name, path.display() );
            }
        }
    }

    Ok(())
}


fn engine( settings: &Settings, block_size: Option<usize> ) -> PlaybackEngine {
    let device = Arc::new( CpalDevice::new( settings.buffer() ) );
    PlaybackEngine::new( device ).with_block_size( block_size.unwrap_or( settings.block_size ) )
}


fn play_file( path: &Path, engine: &PlaybackEngine ) -> Result<()> {
    engine.load( Source::file( path ) )?;

    if let Ok( duration ) = engine.duration() {
        let secs = duration.as_secs();
        println!( "{} ({}:{:02})", path.display(), secs / 60, secs % 60 );
    }

    engine.resume()?;
    if let Some( exit ) = engine.wait()? {
        report_exit( exit );
    }
    Ok(())
}


fn report_exit( exit: LoopExit ) {
    match exit {
        LoopExit::Exhausted => tracing::info!( "Playback complete" ),
        LoopExit::Cancelled( reason ) => tracing::info!( "Playback ended early: {:?}", reason ),
    }
}
