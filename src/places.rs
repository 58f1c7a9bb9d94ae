//! Types related to places, and reading them from input files.

use std::{fmt, fs, path::Path};

use anyhow::{format_err, Context};
use csv::StringRecord;
use tracing::debug;

use crate::{errors::ConfigError, Result};

/// Header names which identify the column containing place names. Compared
/// ignoring ASCII case.
static PLACE_HEADERS: &[&str] = &["place", "place name", "location", "store"];

/// Header names which identify the column containing countries.
static COUNTRY_HEADERS: &[&str] = &["country", "nation"];

/// A place we want to look up, as read from our input file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct InputRow {
    /// The name of the place. This should never be empty, but input files
    /// are messy, so we check [`InputRow::is_valid`] before geocoding.
    pub place: String,
    /// The country, or an empty string if the input didn't specify one.
    pub country: String,
}

impl InputRow {
    /// Create a new input row, trimming surrounding whitespace.
    pub fn new(place: &str, country: &str) -> InputRow {
        InputRow {
            place: place.trim().to_owned(),
            country: country.trim().to_owned(),
        }
    }

    /// A valid `InputRow` has a non-empty `place` field. (And whitespace
    /// doesn't count as non-empty.)
    pub fn is_valid(&self) -> bool {
        !self.place.trim().is_empty()
    }

    /// The country we should actually use for this row: our own country if we
    /// have one, or `default_country` otherwise.
    pub fn effective_country<'a>(&'a self, default_country: &'a str) -> &'a str {
        if self.country.is_empty() {
            default_country
        } else {
            &self.country
        }
    }
}

#[test]
fn input_row_is_valid_does_not_allow_empty_places() {
    assert!(!InputRow::new("", "France").is_valid());
    assert!(!InputRow::new(" \t ", "France").is_valid());
    assert!(InputRow::new("Paris", "").is_valid());
}

#[test]
fn effective_country_prefers_the_row_country() {
    let row = InputRow::new("X", "");
    assert_eq!(row.effective_country("Y"), "Y");
    let row = InputRow::new("X", "Z");
    assert_eq!(row.effective_country("Y"), "Z");
    assert_eq!(row.effective_country(""), "Z");
}

/// The string we actually send to a geocoder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProviderQuery(String);

impl ProviderQuery {
    /// Build a query from a place and a (possibly empty) country.
    pub fn new(place: &str, country: &str) -> ProviderQuery {
        if country.is_empty() {
            ProviderQuery(place.to_owned())
        } else {
            ProviderQuery(format!("{}, {}", place, country))
        }
    }

    /// The query as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProviderQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[test]
fn provider_query_joins_place_and_country() {
    assert_eq!(ProviderQuery::new("Paris", "France").as_str(), "Paris, France");
    assert_eq!(ProviderQuery::new("Paris", "").as_str(), "Paris");
}

/// How is our input file formatted?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InputFormat {
    /// A CSV file with a header row.
    Csv,
    /// One `place,country` pair per line, no header.
    Text,
}

impl InputFormat {
    /// Guess the format of `path` from its extension.
    pub fn from_path(path: &Path) -> InputFormat {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("csv") => InputFormat::Csv,
            _ => InputFormat::Text,
        }
    }
}

#[test]
fn input_format_is_detected_from_extension() {
    assert_eq!(InputFormat::from_path(Path::new("a.csv")), InputFormat::Csv);
    assert_eq!(InputFormat::from_path(Path::new("A.CSV")), InputFormat::Csv);
    assert_eq!(InputFormat::from_path(Path::new("a.txt")), InputFormat::Text);
    assert_eq!(InputFormat::from_path(Path::new("places")), InputFormat::Text);
}

/// Which CSV columns hold our place and country?
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct PlaceColumns {
    /// The index of the place column.
    pub place: usize,
    /// The index of the country column, if we have one.
    pub country: Option<usize>,
}

impl PlaceColumns {
    /// Figure out which columns to use, based on a CSV header.
    ///
    /// If several headers match, the last one wins. If nothing matches, we
    /// fall back to the first column for places and the second (if present)
    /// for countries.
    pub fn from_headers(headers: &StringRecord) -> PlaceColumns {
        let matches = |names: &[&str], header: &str| {
            let header = header.trim();
            names.iter().any(|name| name.eq_ignore_ascii_case(header))
        };
        let headers = headers.iter().collect::<Vec<_>>();
        let place = headers
            .iter()
            .rposition(|h| matches(PLACE_HEADERS, *h))
            .unwrap_or(0);
        let country = headers
            .iter()
            .rposition(|h| matches(COUNTRY_HEADERS, *h))
            .or(if headers.len() > 1 { Some(1) } else { None })
            // Never read the same column twice.
            .filter(|&idx| idx != place);
        PlaceColumns { place, country }
    }

    /// Extract an `InputRow` from a CSV record. Missing cells are treated as
    /// empty.
    pub fn extract_from_record(&self, record: &StringRecord) -> InputRow {
        let place = record.get(self.place).unwrap_or("");
        let country = self
            .country
            .and_then(|idx| record.get(idx))
            .unwrap_or("");
        InputRow::new(place, country)
    }
}

#[test]
fn place_columns_recognize_alternate_headers() {
    use std::iter::FromIterator;
    let standard = StringRecord::from_iter(&["Place", "Country"]);
    let alternate = StringRecord::from_iter(&["Location", "Nation"]);
    assert_eq!(
        PlaceColumns::from_headers(&standard),
        PlaceColumns::from_headers(&alternate),
    );
}

#[test]
fn place_columns_are_found_anywhere_in_header() {
    use std::iter::FromIterator;
    let headers = StringRecord::from_iter(&["id", "NATION", "notes", "Store"]);
    assert_eq!(
        PlaceColumns::from_headers(&headers),
        PlaceColumns {
            place: 3,
            country: Some(1)
        },
    );
}

#[test]
fn place_columns_fall_back_to_position() {
    use std::iter::FromIterator;
    let headers = StringRecord::from_iter(&["name", "land", "extra"]);
    assert_eq!(
        PlaceColumns::from_headers(&headers),
        PlaceColumns {
            place: 0,
            country: Some(1)
        },
    );
    let headers = StringRecord::from_iter(&["name"]);
    assert_eq!(
        PlaceColumns::from_headers(&headers),
        PlaceColumns {
            place: 0,
            country: None
        },
    );
    let headers = StringRecord::from_iter(&["id", "location"]);
    assert_eq!(
        PlaceColumns::from_headers(&headers),
        PlaceColumns {
            place: 1,
            country: None
        },
    );
}

/// Read all the places in `path`, using the file extension to decide how to
/// parse it.
pub fn read_places(path: &Path) -> Result<Vec<InputRow>> {
    if !path.is_file() {
        return Err(ConfigError::InputNotFound(path.to_owned()).into());
    }
    let format = InputFormat::from_path(path);
    debug!("reading {} as {:?}", path.display(), format);
    match format {
        InputFormat::Csv => read_places_csv(path),
        InputFormat::Text => read_places_text(path),
    }
}

/// Read places from a CSV file with a header row.
fn read_places_csv(path: &Path) -> Result<Vec<InputRow>> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format_err!("cannot open {}", path.display()))?;
    // Cells which aren't valid UTF-8 are decoded lossily, so that one bad row
    // can't stop the whole batch.
    let headers = rdr
        .byte_headers()
        .with_context(|| format_err!("cannot read header of {}", path.display()))?
        .to_owned();
    let headers = StringRecord::from_byte_record_lossy(headers);
    let columns = PlaceColumns::from_headers(&headers);
    debug!("input headers: {:?}, using columns {:?}", headers, columns);

    let mut places = vec![];
    for record in rdr.byte_records() {
        let record = record
            .with_context(|| format_err!("error reading {}", path.display()))?;
        let record = StringRecord::from_byte_record_lossy(record);
        places.push(columns.extract_from_record(&record));
    }
    Ok(places)
}

/// Read places from a text file containing one `place,country` per line.
fn read_places_text(path: &Path) -> Result<Vec<InputRow>> {
    let bytes =
        fs::read(path).with_context(|| format_err!("cannot read {}", path.display()))?;
    Ok(parse_places_text(&String::from_utf8_lossy(&bytes)))
}

/// Parse lines of the form `place,country` or just `place`. Blank lines are
/// ignored. Only the first comma separates the place from the country.
fn parse_places_text(text: &str) -> Vec<InputRow> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| match line.split_once(',') {
            Some((place, country)) => InputRow::new(place, country),
            None => InputRow::new(line, ""),
        })
        .collect()
}

#[test]
fn parse_text_lines() {
    let places = parse_places_text(
        "Paris, France\n\n  Tokyo \nSpringfield,Illinois, USA\r\n , Nowhere\n",
    );
    assert_eq!(
        places,
        vec![
            InputRow::new("Paris", "France"),
            InputRow::new("Tokyo", ""),
            InputRow::new("Springfield", "Illinois, USA"),
            InputRow::new("", "Nowhere"),
        ],
    );
}

#[test]
fn read_csv_with_alternate_headers_and_short_rows() {
    use cli_test_dir::TestDir;

    let testdir = TestDir::new("geocode-places", "read_csv_with_alternate_headers");
    testdir.create_file(
        "places.csv",
        "Id,Nation,Location\n1,France,Paris\n2,,Lyon\n3\n",
    );
    let places = read_places(&testdir.path("places.csv")).unwrap();
    assert_eq!(
        places,
        vec![
            InputRow::new("Paris", "France"),
            InputRow::new("Lyon", ""),
            InputRow::new("", ""),
        ],
    );
}

#[test]
fn read_rows_with_invalid_utf8() {
    use cli_test_dir::TestDir;

    let testdir = TestDir::new("geocode-places", "read_rows_with_invalid_utf8");
    let rows = b"Paris,France\nCaf\xe9,France\nLyon,France\n";
    let mut csv = b"Place,Country\n".to_vec();
    csv.extend_from_slice(rows);
    fs::write(testdir.path("places.csv"), csv).unwrap();
    fs::write(testdir.path("places.txt"), rows).unwrap();

    let expected = vec![
        InputRow::new("Paris", "France"),
        InputRow::new("Caf\u{FFFD}", "France"),
        InputRow::new("Lyon", "France"),
    ];
    assert_eq!(read_places(&testdir.path("places.csv")).unwrap(), expected);
    assert_eq!(read_places(&testdir.path("places.txt")).unwrap(), expected);
}

#[test]
fn read_empty_and_header_only_files() {
    use cli_test_dir::TestDir;

    let testdir = TestDir::new("geocode-places", "read_empty_and_header_only_files");
    testdir.create_file("empty.csv", "");
    testdir.create_file("header.csv", "Place,Country\n");
    testdir.create_file("empty.txt", "\n\n");
    assert!(read_places(&testdir.path("empty.csv")).unwrap().is_empty());
    assert!(read_places(&testdir.path("header.csv")).unwrap().is_empty());
    assert!(read_places(&testdir.path("empty.txt")).unwrap().is_empty());
}

#[test]
fn read_missing_file_is_a_config_error() {
    let err = read_places(Path::new("/definitely/not/here.csv")).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<ConfigError>(),
        Some(ConfigError::InputNotFound(_))
    ));
}
