//! Application settings management
//!
//! Persistent defaults for transfer and playback tuning. Command-line flags
//! take precedence over anything stored here.

use std::fs;
use std::path::{ Path, PathBuf };
use std::time::Duration;

use serde::{ Deserialize, Serialize };

use tunestream_core::player::DEFAULT_BLOCK_SIZE;
use tunestream_core::server::DEFAULT_CHUNK_SIZE;


/// Application settings.
#[derive( Debug, Clone, PartialEq, Eq, Serialize, Deserialize )]
#[serde( default )]
pub struct Settings {
    /// Bytes per network write when serving
    pub chunk_size: usize,

    /// Bytes per audio write when playing
    pub block_size: usize,

    /// Interface the server binds to
    pub bind_host: String,

    /// Audio output buffer length in milliseconds
    pub buffer_ms: u64,
}


impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            bind_host: "0.0.0.0".to_string(),
            buffer_ms: 500,
        }
    }
}


impl Settings {
    /// Returns the path to the settings file.
    fn settings_path() -> Option<PathBuf> {
        dirs::config_dir().map( |p| p.join( "tunestream" ).join( "settings.json" ) )
    }


    /// Loads settings from disk, or returns defaults if not found.
    pub fn load() -> Self {
        match Self::settings_path() {
            Some( path ) => Self::load_from( &path ),
            None => Self::default(),
        }
    }


    fn load_from( path: &Path ) -> Self {
        if !path.exists() {
            return Self::default();
        }

        let contents = match fs::read_to_string( path ) {
            Ok( contents ) => contents,
            Err( e ) => {
                tracing::warn!( "Failed to read settings: {}", e );
                return Self::default();
            }
        };

        match serde_json::from_str( &contents ) {
            Ok( settings ) => {
                tracing::debug!( "Loaded settings from {:?}", path );
                settings
            }
            Err( e ) => {
                tracing::warn!( "Ignoring malformed settings {:?}: {}", path, e );
                Self::default()
            }
        }
    }


    /// Audio output buffer length.
    pub fn buffer( &self ) -> Duration {
        Duration::from_millis( self.buffer_ms )
    }
}


#[cfg( test )]
mod tests {
    use super::*;


    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!( Settings::load_from( &dir.path().join( "settings.json" ) ), Settings::default() );
    }


    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "settings.json" );
        fs::write( &path, r#"{ "chunk_size": 4096 }"# ).unwrap();

        let settings = Settings::load_from( &path );
        assert_eq!( settings.chunk_size, 4096 );
        assert_eq!( settings.block_size, DEFAULT_BLOCK_SIZE );
        assert_eq!( settings.bind_host, "0.0.0.0" );
    }


    #[test]
    fn test_malformed_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "settings.json" );
        fs::write( &path, "{ not json" ).unwrap();
        assert_eq!( Settings::load_from( &path ), Settings::default() );
    }
}
