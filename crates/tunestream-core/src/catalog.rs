//! Song catalog
//!
//! An ordered mapping from display name to file location, loaded once from a
//! catalog file and read-only afterwards. Iteration order is the order the
//! names first appeared in the file, which is also the serving order.

use std::fs::File;
use std::io::{ self, BufRead, BufReader, Write };
use std::path::{ Path, PathBuf };

use indexmap::IndexMap;
use thiserror::Error;

use crate::csv::{ self, Records };


/// Index of the display name field in a catalog record.
const NAME_FIELD: usize = 1;

/// Index of the file path field in a catalog record.
const PATH_FIELD: usize = 2;


/// Errors that can occur while loading or querying a catalog.
#[derive( Debug, Error )]
pub enum CatalogError {
    #[error( "Failed to open catalog {path:?}: {source}" )]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error( "Failed to read catalog: {0}" )]
    Read( #[from] io::Error ),

    #[error( "Record {record} is missing a name or path field" )]
    InvalidRecord { record: usize },

    #[error( "Catalog contains no songs" )]
    Empty,

    #[error( "Song not found: {0}" )]
    NotFound( String ),
}


/// Ordered collection of servable songs.
#[derive( Debug, Clone, Default, PartialEq, Eq )]
pub struct Catalog {
    songs: IndexMap<String, PathBuf>,
}


impl Catalog {
    /// Loads a catalog file.
    ///
    /// Relative song paths are resolved against the directory holding the
    /// catalog file.
    pub fn load( path: &Path ) -> Result<Self, CatalogError> {
        let file = File::open( path ).map_err( |source| CatalogError::Open {
            path: path.to_path_buf(),
            source,
        })?;

        let base_dir = path.parent().filter( |p| !p.as_os_str().is_empty() );
        let catalog = Self::from_reader( BufReader::new( file ), base_dir )?;

        tracing::info!( "Loaded {} songs from {:?}", catalog.len(), path );
        Ok( catalog )
    }


    /// Builds a catalog from records read off `reader`.
    ///
    /// Every record must carry a name and a path; the first one that does not
    /// aborts the load.
    pub fn from_reader<R: BufRead>( reader: R, base_dir: Option<&Path> ) -> Result<Self, CatalogError> {
        let mut songs = IndexMap::new();

        for ( index, record ) in Records::new( reader ).enumerate() {
            let mut fields = record?;
            if fields.len() <= PATH_FIELD {
                return Err( CatalogError::InvalidRecord { record: index + 1 } );
            }

            let location = PathBuf::from( fields.swap_remove( PATH_FIELD ) );
            let name = fields.swap_remove( NAME_FIELD );

            let location = match base_dir {
                Some( dir ) if location.is_relative() => dir.join( location ),
                _ => location,
            };

            if let Some( previous ) = songs.insert( name, location ) {
                tracing::debug!( "Record {} replaces earlier entry {:?}", index + 1, previous );
            }
        }

        if songs.is_empty() {
            return Err( CatalogError::Empty );
        }

        Ok( Self { songs } )
    }


    /// Returns song names in serving order.
    pub fn names( &self ) -> Vec<&str> {
        self.songs.keys().map( String::as_str ).collect()
    }


    /// Returns the file location for a song.
    pub fn path_for( &self, name: &str ) -> Result<&Path, CatalogError> {
        self.songs
            .get( name )
            .map( PathBuf::as_path )
            .ok_or_else( || CatalogError::NotFound( name.to_string() ) )
    }


    /// Iterates over `(name, path)` pairs in serving order.
    pub fn entries( &self ) -> impl Iterator<Item = ( &str, &Path )> {
        self.songs.iter().map( |( name, path )| ( name.as_str(), path.as_path() ) )
    }


    pub fn len( &self ) -> usize {
        self.songs.len()
    }


    pub fn is_empty( &self ) -> bool {
        self.songs.is_empty()
    }


    /// Writes the catalog as `(index, name, path)` records.
    pub fn write_to<W: Write>( &self, writer: &mut W ) -> io::Result<()> {
        for ( index, ( name, path ) ) in self.songs.iter().enumerate() {
            let index = ( index + 1 ).to_string();
            let path = path.to_string_lossy();
            csv::write_line( writer, &[ index.as_str(), name.as_str(), &*path ] )?;
        }
        writer.flush()
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::io::Cursor;


    fn catalog_from( text: &str ) -> Result<Catalog, CatalogError> {
        Catalog::from_reader( Cursor::new( text.as_bytes() ), None )
    }


    #[test]
    fn test_single_record() {
        let catalog = catalog_from( "\"1\",\"X\",\"x.wav\"\n" ).unwrap();
        assert_eq!( catalog.names(), vec![ "X" ] );
        assert_eq!( catalog.path_for( "X" ).unwrap(), Path::new( "x.wav" ) );
    }


    #[test]
    fn test_empty_catalog_fails() {
        assert!( matches!( catalog_from( "" ), Err( CatalogError::Empty ) ) );
        assert!( matches!( catalog_from( "\r\r" ), Err( CatalogError::Empty ) ) );
    }


    #[test]
    fn test_short_record_aborts_load() {
        let result = catalog_from( "1,A,a.wav\n2,B\n3,C,c.wav\n" );
        assert!( matches!( result, Err( CatalogError::InvalidRecord { record: 2 } ) ) );
    }


    #[test]
    fn test_blank_line_is_invalid_record() {
        let result = catalog_from( "1,A,a.wav\n\n2,B,b.wav\n" );
        assert!( matches!( result, Err( CatalogError::InvalidRecord { record: 2 } ) ) );
    }


    #[test]
    fn test_order_is_file_order() {
        let catalog = catalog_from( "1,Zebra,z.wav\n2,Apple,a.wav\n3,Mango,m.ogg,extra\n" ).unwrap();
        assert_eq!( catalog.names(), vec![ "Zebra", "Apple", "Mango" ] );
    }


    #[test]
    fn test_duplicate_name_overwrites_in_place() {
        let catalog = catalog_from( "1,A,first.wav\n2,B,b.wav\n3,A,second.wav\n" ).unwrap();
        assert_eq!( catalog.names(), vec![ "A", "B" ] );
        assert_eq!( catalog.path_for( "A" ).unwrap(), Path::new( "second.wav" ) );
    }


    #[test]
    fn test_missing_name() {
        let catalog = catalog_from( "1,A,a.wav\n" ).unwrap();
        assert!( matches!( catalog.path_for( "nope" ), Err( CatalogError::NotFound( _ ) ) ) );
    }


    #[test]
    fn test_relative_paths_resolve_against_base_dir() {
        let base = Path::new( "/srv/music" );
        let text = "1,Rel,songs/a.wav\n2,Abs,/tmp/b.wav\n";
        let catalog = Catalog::from_reader( Cursor::new( text.as_bytes() ), Some( base ) ).unwrap();
        assert_eq!( catalog.path_for( "Rel" ).unwrap(), Path::new( "/srv/music/songs/a.wav" ) );
        assert_eq!( catalog.path_for( "Abs" ).unwrap(), Path::new( "/tmp/b.wav" ) );
    }


    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = Catalog::load( &dir.path().join( "missing.csv" ) );
        assert!( matches!( result, Err( CatalogError::Open { .. } ) ) );
    }


    #[test]
    fn test_load_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join( "songs.csv" );
        std::fs::write( &path, "\"1\",\"Track \"\"A\"\"\",\"song.wav\"\r\n" ).unwrap();

        let catalog = Catalog::load( &path ).unwrap();
        assert_eq!( catalog.names(), vec![ "Track \"A\"" ] );
        assert_eq!( catalog.path_for( "Track \"A\"" ).unwrap(), dir.path().join( "song.wav" ) );
    }


    #[test]
    fn test_write_then_reload() {
        let catalog = catalog_from( "1,\"Quote \"\"me\"\"\",/a.wav\n2,\"Comma, here\",/b.wav\n" ).unwrap();

        let mut out = Vec::new();
        catalog.write_to( &mut out ).unwrap();
        let reloaded = Catalog::from_reader( Cursor::new( out ), None ).unwrap();

        assert_eq!( reloaded, catalog );
    }
}
