//! Jukebox stream server
//!
//! Serves a catalog one song per connection, in catalog order. Each accepted
//! peer receives the raw bytes of exactly one file, after which the server
//! closes the connection and waits for the next peer. There is no framing on
//! the wire; the close marks the end of the song.

use std::fs::File;
use std::io::{ self, Read, Write };
use std::net::{ Shutdown, SocketAddr, TcpListener, TcpStream, ToSocketAddrs };
use std::path::Path;

use thiserror::Error;

use crate::catalog::Catalog;


/// Default transfer chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 1024;


/// Errors that end a serve loop.
#[derive( Debug, Error )]
pub enum ServerError {
    #[error( "Failed to bind {addr}: {source}" )]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error( "Transfer of {name:?} failed: {source}" )]
    Transfer {
        name: String,
        #[source]
        source: io::Error,
    },
}


/// Totals for a completed serve loop.
#[derive( Debug, Clone, Copy, Default, PartialEq, Eq )]
pub struct ServeReport {
    pub songs: usize,
    pub bytes: u64,
}


/// The song being sent to one accepted peer.
struct StreamSession<'a> {
    name: &'a str,
    path: &'a Path,
}


impl StreamSession<'_> {
    /// Copies the whole file to `peer` in `chunk_size` pieces.
    fn transfer( &self, peer: &mut TcpStream, chunk_size: usize ) -> io::Result<u64> {
        let mut file = File::open( self.path )?;
        let mut chunk = vec![ 0u8; chunk_size ];
        let mut total = 0u64;

        loop {
            let count = match file.read( &mut chunk ) {
                Ok( 0 ) => break,
                Ok( count ) => count,
                Err( e ) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err( e ) => return Err( e ),
            };
            peer.write_all( &chunk[ ..count ] )?;
            total += count as u64;
        }

        peer.flush()?;
        peer.shutdown( Shutdown::Write )?;
        Ok( total )
    }
}


/// A bound listener that serves each catalog entry to one peer.
#[derive( Debug )]
pub struct StreamServer {
    listener: TcpListener,
    chunk_size: usize,
}


impl StreamServer {
    /// Binds the listening socket.
    pub fn bind<A: ToSocketAddrs + std::fmt::Debug>( addr: A ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind( &addr ).map_err( |source| ServerError::Bind {
            addr: format!( "{:?}", addr ),
            source,
        })?;

        if let Ok( local ) = listener.local_addr() {
            tracing::info!( "Listening on {}", local );
        }

        Ok( Self { listener, chunk_size: DEFAULT_CHUNK_SIZE } )
    }


    /// Sets the transfer chunk size.
    pub fn with_chunk_size( mut self, chunk_size: usize ) -> Self {
        self.chunk_size = chunk_size.max( 1 );
        self
    }


    /// Returns the bound address.
    pub fn local_addr( &self ) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }


    /// Serves every catalog entry once, in order, then closes the listener.
    ///
    /// The first accept or transfer failure ends the loop; later songs are not
    /// served.
    pub fn serve( self, catalog: &Catalog ) -> Result<ServeReport, ServerError> {
        let mut report = ServeReport::default();

        for ( name, path ) in catalog.entries() {
            let session = StreamSession { name, path };
            let transfer_error = |source| ServerError::Transfer { name: name.to_string(), source };

            tracing::info!( "Waiting for a listener for {:?}", session.name );
            let ( mut peer, peer_addr ) = self.listener.accept().map_err( transfer_error )?;
            tracing::info!( "Serving {:?} from {:?} to {}", session.name, session.path, peer_addr );

            let bytes = session.transfer( &mut peer, self.chunk_size ).map_err( transfer_error )?;
            drop( peer );

            tracing::info!( "Sent {} bytes of {:?} to {}", bytes, session.name, peer_addr );
            report.songs += 1;
            report.bytes += bytes;
        }

        tracing::info!( "Served {} songs, shutting down", report.songs );
        Ok( report )
    }
}


/// Binds `0.0.0.0:port` and serves the catalog once.
pub fn serve( catalog: &Catalog, port: u16 ) -> Result<ServeReport, ServerError> {
    StreamServer::bind( ( "0.0.0.0", port ) )?.serve( catalog )
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::Ipv4Addr;
    use std::thread;


    fn catalog_in( dir: &Path, songs: &[( &str, &str, &[u8] )] ) -> Catalog {
        let mut text = String::new();
        for ( i, ( name, file, contents ) ) in songs.iter().enumerate() {
            std::fs::write( dir.join( file ), contents ).unwrap();
            text.push_str( &format!( "{},{},{}\n", i + 1, name, file ) );
        }
        Catalog::from_reader( Cursor::new( text.into_bytes() ), Some( dir ) ).unwrap()
    }


    fn fetch( addr: SocketAddr ) -> Vec<u8> {
        let mut stream = TcpStream::connect( addr ).unwrap();
        let mut out = Vec::new();
        stream.read_to_end( &mut out ).unwrap();
        out
    }


    #[test]
    fn test_bind_failure() {
        let taken = TcpListener::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap();
        let addr = taken.local_addr().unwrap();
        let result = StreamServer::bind( addr );
        assert!( matches!( result, Err( ServerError::Bind { .. } ) ) );
    }


    #[test]
    fn test_chunking_does_not_change_content() {
        let dir = tempfile::tempdir().unwrap();
        let contents: Vec<u8> = ( 0..10_007u32 ).map( |i| ( i % 251 ) as u8 ).collect();
        let catalog = catalog_in( dir.path(), &[ ( "Odd", "odd.bin", &contents ) ] );

        let server = StreamServer::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap().with_chunk_size( 333 );
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn( move || server.serve( &catalog ) );

        assert_eq!( fetch( addr ), contents );
        assert_eq!( handle.join().unwrap().unwrap(), ServeReport { songs: 1, bytes: 10_007 } );
    }


    #[test]
    fn test_empty_file_is_served_as_immediate_close() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = catalog_in( dir.path(), &[ ( "Silence", "empty.wav", b"" ) ] );

        let server = StreamServer::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn( move || server.serve( &catalog ) );

        assert!( fetch( addr ).is_empty() );
        assert_eq!( handle.join().unwrap().unwrap().songs, 1 );
    }


    #[test]
    fn test_missing_file_aborts_loop() {
        let dir = tempfile::tempdir().unwrap();
        let mut catalog_text = String::from( "1,Gone,missing.wav\n" );
        catalog_text.push_str( "2,Present,present.wav\n" );
        std::fs::write( dir.path().join( "present.wav" ), b"data" ).unwrap();
        let catalog = Catalog::from_reader( Cursor::new( catalog_text.into_bytes() ), Some( dir.path() ) ).unwrap();

        let server = StreamServer::bind( ( Ipv4Addr::LOCALHOST, 0 ) ).unwrap();
        let addr = server.local_addr().unwrap();
        let handle = thread::spawn( move || server.serve( &catalog ) );

        // The first peer gets nothing; the server gives up instead of moving on
        assert!( fetch( addr ).is_empty() );
        match handle.join().unwrap() {
            Err( ServerError::Transfer { name, .. } ) => assert_eq!( name, "Gone" ),
            other => panic!( "expected transfer error, got {:?}", other ),
        }
        assert!( TcpStream::connect( addr ).is_err() );
    }
}
