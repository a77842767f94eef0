//! Command-line argument parsing for Tunestream.

use std::path::PathBuf;

use clap::{ Parser, Subcommand };


/// Tunestream - A one-song-per-connection network jukebox.
#[derive( Parser, Debug )]
#[command( name = "tunestream" )]
#[command( version, about, long_about = None )]
pub struct Args {
    #[command( subcommand )]
    pub command: Mode,
}


#[derive( Subcommand, Debug, PartialEq, Eq )]
pub enum Mode {
    /// Serve every song in a catalog once, in order.
    Server {
        /// Catalog file of `index,name,path` records.
        catalog: PathBuf,

        /// Port to listen on.
        port: u16,

        /// Bytes per network write.
        #[arg( long )]
        chunk_size: Option<usize>,
    },

    /// Receive one song from a server and play it.
    Client {
        host: String,

        port: u16,

        /// Bytes per audio write.
        #[arg( long )]
        block_size: Option<usize>,

        /// Write the received bytes to a file instead of playing them.
        #[arg( long, value_name = "FILE" )]
        save: Option<PathBuf>,
    },

    /// Play a local audio file.
    Play {
        file: PathBuf,

        /// Bytes per audio write.
        #[arg( long )]
        block_size: Option<usize>,
    },

    /// Print a catalog in serving order.
    List {
        catalog: PathBuf,
    },
}


#[cfg( test )]
mod tests {
    use super::*;
    use clap::error::ErrorKind;


    #[test]
    fn test_server_args() {
        let args = Args::try_parse_from( [ "tunestream", "server", "songs.csv", "5000" ] ).unwrap();
        assert_eq!( args.command, Mode::Server {
            catalog: PathBuf::from( "songs.csv" ),
            port: 5000,
            chunk_size: None,
        });
    }


    #[test]
    fn test_client_args_with_options() {
        let args = Args::try_parse_from([
            "tunestream", "client", "localhost", "5000", "--block-size", "4096", "--save", "out.wav",
        ]).unwrap();
        assert_eq!( args.command, Mode::Client {
            host: "localhost".to_string(),
            port: 5000,
            block_size: Some( 4096 ),
            save: Some( PathBuf::from( "out.wav" ) ),
        });
    }


    #[test]
    fn test_unknown_mode_prints_usage() {
        let err = Args::try_parse_from( [ "tunestream", "jukebox", "songs.csv" ] ).unwrap_err();
        assert_eq!( err.kind(), ErrorKind::InvalidSubcommand );
        assert!( err.render().to_string().contains( "Usage" ) );
    }


    #[test]
    fn test_wrong_argument_count() {
        let err = Args::try_parse_from( [ "tunestream", "server", "songs.csv" ] ).unwrap_err();
        assert_eq!( err.kind(), ErrorKind::MissingRequiredArgument );

        let err = Args::try_parse_from( [ "tunestream", "list", "a.csv", "b.csv" ] ).unwrap_err();
        assert_eq!( err.kind(), ErrorKind::UnknownArgument );
    }


    #[test]
    fn test_bad_port() {
        assert!( Args::try_parse_from( [ "tunestream", "client", "host", "99999" ] ).is_err() );
    }
}
