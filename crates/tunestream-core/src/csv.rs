//! Quoted, comma-delimited record codec
//!
//! Reads and writes the line format used by song catalogs. Fields may be
//! wrapped in double quotes; inside quotes a doubled quote is one literal
//! quote, and commas and line breaks are plain text.

use std::io::{ self, BufRead, Write };


const QUOTE: u8 = b'"';
const COMMA: u8 = b',';
const CR: u8 = b'\r';
const LF: u8 = b'\n';


/// Reads a single byte, or None at end of input.
fn next_byte<R: BufRead + ?Sized>( reader: &mut R ) -> io::Result<Option<u8>> {
    loop {
        let byte = match reader.fill_buf() {
            Ok( buf ) => buf.first().copied(),
            Err( e ) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err( e ) => return Err( e ),
        };
        if byte.is_some() {
            reader.consume( 1 );
        }
        return Ok( byte );
    }
}


fn into_field( bytes: Vec<u8> ) -> io::Result<String> {
    String::from_utf8( bytes ).map_err( |e| io::Error::new( io::ErrorKind::InvalidData, e ) )
}


/// Parses the next record from the reader.
///
/// Returns `Ok(None)` when the input is exhausted before any character of a
/// new record was consumed. An empty line is a record with one empty field.
pub fn parse_line<R: BufRead + ?Sized>( reader: &mut R ) -> io::Result<Option<Vec<String>>> {
    let mut byte = next_byte( reader )?;
    while byte == Some( CR ) {
        byte = next_byte( reader )?;
    }

    let Some( mut ch ) = byte else {
        return Ok( None );
    };

    let mut fields = Vec::new();
    let mut current: Vec<u8> = Vec::new();
    let mut in_quotes = false;
    // Set once the current field has had a quoted section, so that a quote
    // directly re-opening it is an escaped literal.
    let mut quoted = false;

    loop {
        if in_quotes {
            quoted = true;
            if ch == QUOTE {
                in_quotes = false;
            } else {
                current.push( ch );
            }
        } else {
            match ch {
                QUOTE => {
                    if quoted {
                        current.push( QUOTE );
                    }
                    in_quotes = true;
                }
                COMMA => {
                    fields.push( into_field( std::mem::take( &mut current ) )? );
                    quoted = false;
                }
                CR => {}
                LF => break,
                other => current.push( other ),
            }
        }

        match next_byte( reader )? {
            Some( b ) => ch = b,
            None => break,
        }
    }

    fields.push( into_field( current )? );
    Ok( Some( fields ) )
}


/// Writes one record, quoting every field and terminating it with `\n`.
pub fn write_line<W, S>( writer: &mut W, fields: &[S] ) -> io::Result<()>
where
    W: Write + ?Sized,
    S: AsRef<str>,
{
    let mut line = String::new();
    for ( i, field ) in fields.iter().enumerate() {
        if i > 0 {
            line.push( ',' );
        }
        line.push( '"' );
        line.push_str( &field.as_ref().replace( '"', "\"\"" ) );
        line.push( '"' );
    }
    line.push( '\n' );

    writer.write_all( line.as_bytes() )
}


/// Iterator over all remaining records of a reader.
pub struct Records<R> {
    reader: R,
    done: bool,
}


impl<R: BufRead> Records<R> {
    pub fn new( reader: R ) -> Self {
        Self { reader, done: false }
    }
}


impl<R: BufRead> Iterator for Records<R> {
    type Item = io::Result<Vec<String>>;


    fn next( &mut self ) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match parse_line( &mut self.reader ) {
            Ok( Some( fields ) ) => Some( Ok( fields ) ),
            Ok( None ) => {
                self.done = true;
                None
            }
            Err( e ) => {
                self.done = true;
                Some( Err( e ) )
            }
        }
    }
}


#[cfg( test )]
mod tests {
    use super::*;
    use std::io::Cursor;


    fn parse_all( input: &str ) -> Vec<Vec<String>> {
        Records::new( Cursor::new( input.as_bytes() ) )
            .collect::<io::Result<Vec<_>>>()
            .unwrap()
    }


    #[test]
    fn test_parse_escaped_quotes() {
        let mut input = Cursor::new( "\"1\",\"Track \"\"A\"\"\",\"song.wav\"\n" );
        let fields = parse_line( &mut input ).unwrap().unwrap();
        assert_eq!( fields, vec![ "1", "Track \"A\"", "song.wav" ] );
    }


    #[test]
    fn test_parse_unquoted_fields() {
        let records = parse_all( "1,First,a.wav\n2,Second,b.wav\n" );
        assert_eq!( records, vec![
            vec![ "1", "First", "a.wav" ],
            vec![ "2", "Second", "b.wav" ],
        ]);
    }


    #[test]
    fn test_parse_crlf() {
        let records = parse_all( "1,A,a.wav\r\n2,B,b.wav\r\n" );
        assert_eq!( records, vec![
            vec![ "1", "A", "a.wav" ],
            vec![ "2", "B", "b.wav" ],
        ]);
    }


    #[test]
    fn test_quoted_delimiters_are_literal() {
        let records = parse_all( "\"a,b\",\"line\nbreak\",c\n" );
        assert_eq!( records, vec![ vec![ "a,b", "line\nbreak", "c" ] ] );
    }


    #[test]
    fn test_end_of_input_is_distinct_from_empty_record() {
        let mut input = Cursor::new( "\n" );
        assert_eq!( parse_line( &mut input ).unwrap(), Some( vec![ String::new() ] ) );
        assert_eq!( parse_line( &mut input ).unwrap(), None );

        let mut empty = Cursor::new( "" );
        assert_eq!( parse_line( &mut empty ).unwrap(), None );
    }


    #[test]
    fn test_last_record_without_newline() {
        let records = parse_all( "a,b\nc,d" );
        assert_eq!( records, vec![ vec![ "a", "b" ], vec![ "c", "d" ] ] );
    }


    #[test]
    fn test_unterminated_quote_ends_record() {
        let records = parse_all( "x,\"open field" );
        assert_eq!( records, vec![ vec![ "x", "open field" ] ] );
    }


    #[test]
    fn test_empty_fields() {
        let records = parse_all( ",,\n\"\",\"\"\n" );
        assert_eq!( records, vec![ vec![ "", "", "" ], vec![ "", "" ] ] );
    }


    #[test]
    fn test_invalid_utf8_is_rejected() {
        let mut input = Cursor::new( vec![ b'a', 0xff, b'\n' ] );
        let err = parse_line( &mut input ).unwrap_err();
        assert_eq!( err.kind(), io::ErrorKind::InvalidData );
    }


    #[test]
    fn test_write_quotes_everything() {
        let mut out = Vec::new();
        write_line( &mut out, &[ "1", "Say \"hi\"", "" ] ).unwrap();
        assert_eq!( String::from_utf8( out ).unwrap(), "\"1\",\"Say \"\"hi\"\"\",\"\"\n" );
    }


    #[test]
    fn test_written_records_parse_back() {
        let cases: Vec<Vec<&str>> = vec![
            vec![ "" ],
            vec![ "plain" ],
            vec![ "\"" ],
            vec![ "\"\"\"", "ends with quote\"", "\"starts" ],
            vec![ "comma, inside", "new\nline", "carriage\r\nreturn" ],
            vec![ "", "", "trailing empty", "" ],
            vec![ "ünïcødé", "日本語", "emoji 🎵" ],
        ];

        let mut out = Vec::new();
        for fields in &cases {
            write_line( &mut out, fields ).unwrap();
        }

        let parsed = Records::new( Cursor::new( out ) )
            .collect::<io::Result<Vec<_>>>()
            .unwrap();
        assert_eq!( parsed.len(), cases.len() );
        for ( got, want ) in parsed.iter().zip( &cases ) {
            assert_eq!( got, want );
        }
    }
}
