//! Decoding of the textual header that precedes the binary table of a TRF.
//!
//! Layout of the header:
//!
//! ```text
//! CTRL date CTRL zone DELIM field CTRL machine CTRL declaration (TAB marker)* TAB 0xDC 0x00
//! ```
//!
//! The declaration lists the channels of each table record, in order, with the integer
//! kind and the scale/offset used to recover physical values:
//!
//! ```text
//! TRF<version>;<interval (s)>;<name>=<kind>:<scale>:<offset>;...
//! ```
use regex::bytes::Regex;
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time, UtcOffset};

use super::constants::*;
use super::error::TrfHeaderError;

const HEADER_PATTERN: &str = concat!(
    r"(?-u)\A[\x00-\x19]",              // start byte
    r"(\d\d[/-]\d\d[/-]\d\d \d\d:\d\d:\d\d Z)", // date
    r"[\x00-\x19]",                    // divider
    r"((\+|\-)\d\d:\d\d)",             // zone
    r"[\x00-\x25]",                    // divider
    r"([\x20-\x7F]*)",                 // field label and name
    r"[\x00-\x19]",                    // divider
    r"([\x20-\x7F]+)",                 // machine
    r"[\x00-\x19]",                    // divider
);

/// Metadata identifying a delivered field
#[derive(Debug, Clone, PartialEq)]
pub struct Header {
    pub machine: String,
    /// UTC timestamp as written, e.g. `19/06/14 13:05:22 Z`
    pub date: String,
    /// Local zone offset, e.g. `+10:00`
    pub timezone: String,
    /// Empty for service mode beams
    pub field_label: String,
    pub field_name: String,
}

impl Header {
    /// The delivery timestamp in UTC
    pub fn utc_datetime(&self) -> Result<OffsetDateTime, TrfHeaderError> {
        let bad = || TrfHeaderError::BadTimestamp(self.date.clone());
        let digits = |start: usize| -> Result<u8, TrfHeaderError> {
            self.date
                .get(start..start + 2)
                .and_then(|s| s.parse::<u8>().ok())
                .ok_or_else(bad)
        };
        // YY/MM/DD HH:MM:SS Z
        let year = 2000 + digits(0)? as i32;
        let month = Month::try_from(digits(3)?).map_err(|_| bad())?;
        let date = Date::from_calendar_date(year, month, digits(6)?).map_err(|_| bad())?;
        let time = Time::from_hms(digits(9)?, digits(12)?, digits(15)?).map_err(|_| bad())?;
        Ok(PrimitiveDateTime::new(date, time).assume_utc())
    }

    /// The delivery timestamp at the linac's local zone offset
    pub fn local_datetime(&self) -> Result<OffsetDateTime, TrfHeaderError> {
        Ok(self.utc_datetime()?.to_offset(self.utc_offset()?))
    }

    pub fn utc_offset(&self) -> Result<UtcOffset, TrfHeaderError> {
        let bad = || TrfHeaderError::BadTimestamp(self.timezone.clone());
        let sign: i8 = match self.timezone.get(0..1) {
            Some("+") => 1,
            Some("-") => -1,
            _ => return Err(bad()),
        };
        let hours = self
            .timezone
            .get(1..3)
            .and_then(|s| s.parse::<i8>().ok())
            .ok_or_else(bad)?;
        let minutes = self
            .timezone
            .get(4..6)
            .and_then(|s| s.parse::<i8>().ok())
            .ok_or_else(bad)?;
        UtcOffset::from_hms(sign * hours, sign * minutes, 0).map_err(|_| bad())
    }
}

/// Integer encoding of a channel in the table records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    I16,
    U16,
    I32,
}

impl ChannelKind {
    pub fn size(&self) -> usize {
        match self {
            Self::I16 | Self::U16 => 2,
            Self::I32 => 4,
        }
    }
}

impl TryFrom<(&str, &str)> for ChannelKind {
    type Error = TrfHeaderError;
    fn try_from((name, kind): (&str, &str)) -> Result<Self, Self::Error> {
        match kind {
            "i16" => Ok(Self::I16),
            "u16" => Ok(Self::U16),
            "i32" => Ok(Self::I32),
            _ => Err(TrfHeaderError::UnknownChannelKind {
                name: String::from(name),
                kind: String::from(kind),
            }),
        }
    }
}

/// One channel of a table record, as declared in the header
#[derive(Debug, Clone, PartialEq)]
pub struct Channel {
    /// Raw channel name; canonicalised by the machine descriptor when decoding
    pub name: String,
    pub kind: ChannelKind,
    pub scale: f64,
    pub offset: f64,
}

/// The record layout declared in a TRF header
#[derive(Debug, Clone, PartialEq)]
pub struct TableLayout {
    pub version: String,
    /// Sampling period in seconds
    pub interval: f64,
    pub channels: Vec<Channel>,
}

impl TableLayout {
    pub fn record_size(&self) -> usize {
        self.channels.iter().map(|c| c.kind.size()).sum()
    }

    /// Render the declaration back to its header form
    pub fn to_declaration(&self) -> String {
        let mut declaration = format!(
            "{TRF_DECLARATION_MAGIC}{};{}",
            self.version, self.interval
        );
        for channel in self.channels.iter() {
            let kind = match channel.kind {
                ChannelKind::I16 => "i16",
                ChannelKind::U16 => "u16",
                ChannelKind::I32 => "i32",
            };
            declaration.push_str(&format!(
                ";{}={kind}:{}:{}",
                channel.name, channel.scale, channel.offset
            ));
        }
        declaration
    }
}

/// Find the length of the header of a TRF file.
///
/// The header declares one column marker per channel, so when the declaration parses and
/// the marker run after it is intact the length follows from the layout. Otherwise the
/// header is split on the delimiter, and the first token from the seventh onwards that is
/// longer than a column marker starts the table; the header includes the delimiter before
/// it and the two marker bytes that open it.
pub fn determine_header_length(contents: &[u8]) -> Result<usize, TrfHeaderError> {
    match header_length_from_layout(contents) {
        Some(length) => Ok(length),
        None => header_length_from_tokens(contents),
    }
}

// A table whose first byte is the delimiter leaves only the two terminator bytes in the
// token after the markers, which the token rule cannot tell apart from the table.
fn header_length_from_layout(contents: &[u8]) -> Option<usize> {
    let (_, preamble_end) = match_preamble(contents).ok()?;
    let declaration_length = contents[preamble_end..]
        .iter()
        .position(|byte| *byte == TRF_DELIMITER)?;
    let markers_start = preamble_end + declaration_length;
    let declaration = String::from_utf8_lossy(&contents[preamble_end..markers_start]);
    let layout = parse_declaration(&declaration).ok()?;

    let marker_stride = TRF_MARKER_LENGTH + 1;
    let length = markers_start + marker_stride * layout.channels.len() + TRF_MARKER_LENGTH;
    if length > contents.len() {
        return None;
    }
    // Every marker and the terminator open with the delimiter and the marker prefix
    let intact = contents[markers_start..length]
        .chunks(marker_stride)
        .all(|marker| marker[0] == TRF_DELIMITER && marker[1..3] == TRF_MARKER_PREFIX);
    intact.then_some(length)
}

fn header_length_from_tokens(contents: &[u8]) -> Result<usize, TrfHeaderError> {
    let tokens: Vec<&[u8]> = contents.split(|byte| *byte == TRF_DELIMITER).collect();
    let index = tokens
        .iter()
        .enumerate()
        .skip(TRF_HEADER_ROW_SKIPS)
        .find(|(_, token)| token.len() > TRF_MARKER_LENGTH)
        .map(|(index, _)| index)
        .ok_or(TrfHeaderError::HeaderLengthNotFound)?;

    // Length of tokens[..index] joined by the delimiter
    let joined: usize =
        tokens[..index].iter().map(|token| token.len()).sum::<usize>() + index.saturating_sub(1);
    let length = joined + TRF_MARKER_LENGTH;
    if length > contents.len() || contents[length - 2..length] != TRF_MARKER_PREFIX {
        return Err(TrfHeaderError::HeaderLengthNotFound);
    }
    Ok(length)
}

/// Decode the identifying metadata at the start of a TRF header
pub fn decode_header(header: &[u8]) -> Result<Header, TrfHeaderError> {
    let (header, _) = match_preamble(header)?;
    Ok(header)
}

/// Decode the channel declaration that follows the preamble
pub fn decode_layout(header: &[u8]) -> Result<TableLayout, TrfHeaderError> {
    let (_, preamble_end) = match_preamble(header)?;
    let declaration = header[preamble_end..]
        .split(|byte| *byte == TRF_DELIMITER)
        .next()
        .unwrap_or_default();
    let declaration = String::from_utf8_lossy(declaration);
    parse_declaration(&declaration)
}

fn match_preamble(header: &[u8]) -> Result<(Header, usize), TrfHeaderError> {
    let pattern = Regex::new(HEADER_PATTERN)?;
    let captures = pattern
        .captures(header)
        .ok_or(TrfHeaderError::HeaderMismatch)?;

    let group = |index: usize| -> String {
        captures
            .get(index)
            .map(|m| String::from_utf8_lossy(m.as_bytes()).into_owned())
            .unwrap_or_default()
    };
    let field = group(4);
    let (field_label, field_name) = match field.split('/').collect::<Vec<&str>>()[..] {
        [label, name] => (String::from(label), String::from(name)),
        _ => (String::new(), field.clone()),
    };

    let preamble_end = captures.get(0).map(|m| m.end()).unwrap_or_default();
    Ok((
        Header {
            machine: group(5),
            date: group(1),
            timezone: group(2),
            field_label,
            field_name,
        },
        preamble_end,
    ))
}

fn parse_declaration(declaration: &str) -> Result<TableLayout, TrfHeaderError> {
    let bad = || TrfHeaderError::BadDeclaration(String::from(declaration));
    let body = declaration
        .strip_prefix(TRF_DECLARATION_MAGIC)
        .ok_or_else(bad)?;

    let mut entries = body.split(';');
    let version = String::from(entries.next().ok_or_else(bad)?);
    let interval: f64 = entries
        .next()
        .and_then(|s| s.trim().parse().ok())
        .ok_or_else(bad)?;
    if !interval.is_finite() || interval <= 0.0 {
        return Err(bad());
    }

    let mut channels = Vec::new();
    for entry in entries.filter(|e| !e.is_empty()) {
        let (name, encoding) = entry.rsplit_once('=').ok_or_else(bad)?;
        let parts: Vec<&str> = encoding.split(':').collect();
        if parts.len() < 3 || parts[1].is_empty() || parts[2].is_empty() {
            return Err(TrfHeaderError::MissingScale(String::from(name)));
        }
        let kind = ChannelKind::try_from((name, parts[0]))?;
        let scale: f64 = parts[1].parse().map_err(|_| bad())?;
        let offset: f64 = parts[2].parse().map_err(|_| bad())?;
        channels.push(Channel {
            name: String::from(name),
            kind,
            scale,
            offset,
        });
    }

    if channels.is_empty() {
        return Err(bad());
    }

    Ok(TableLayout {
        version,
        interval,
        channels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREAMBLE: &[u8] = b"\x0119/06/14 13:05:22 Z\x01+10:00\x01G1/6X\x01LA1\x01";

    #[test]
    fn decodes_the_preamble() {
        let header = decode_header(PREAMBLE).unwrap();
        assert_eq!(
            header,
            Header {
                machine: String::from("LA1"),
                date: String::from("19/06/14 13:05:22 Z"),
                timezone: String::from("+10:00"),
                field_label: String::from("G1"),
                field_name: String::from("6X"),
            }
        );
    }

    #[test]
    fn field_without_separator_is_all_name() {
        let header = decode_header(b"\t20/09/24 06:29:58 Z\t-02:30\t\t2619\t").unwrap();
        assert_eq!(header.field_label, "");
        assert_eq!(header.field_name, "");
        assert_eq!(header.machine, "2619");
        let header = decode_header(b"\t20/09/24 06:29:58 Z\t-02:30\tAP G0\t2619\t").unwrap();
        assert_eq!(header.field_label, "");
        assert_eq!(header.field_name, "AP G0");
    }

    #[test]
    fn mismatched_preamble_is_an_error() {
        assert_eq!(
            decode_header(b"\x0119-06-14 13:05 Z\x01+10:00\x01\x01LA1\x01"),
            Err(TrfHeaderError::HeaderMismatch)
        );
        assert_eq!(decode_header(b""), Err(TrfHeaderError::HeaderMismatch));
    }

    #[test]
    fn parses_timestamps() {
        let header = decode_header(PREAMBLE).unwrap();
        let utc = header.utc_datetime().unwrap();
        assert_eq!(utc.year(), 2019);
        assert_eq!(utc.month(), Month::June);
        assert_eq!((utc.day(), utc.hour(), utc.minute(), utc.second()), (14, 13, 5, 22));
        assert!(utc.offset().is_utc());

        let local = header.local_datetime().unwrap();
        assert_eq!(local, utc);
        assert_eq!(local.hour(), 23);
        assert_eq!(local.offset().whole_hours(), 10);
    }

    #[test]
    fn parses_the_declaration() {
        let mut header = PREAMBLE.to_vec();
        header.extend_from_slice(
            b"TRF3;0.04;Step Dose/Actual Value (Mu)=i32:0.001:0;Step Gantry/Scaled Actual (deg)=i16:0.1:180\t\xdc\x00\xe0",
        );
        let layout = decode_layout(&header).unwrap();
        assert_eq!(layout.version, "3");
        assert_eq!(layout.interval, 0.04);
        assert_eq!(layout.channels.len(), 2);
        assert_eq!(layout.channels[1].kind, ChannelKind::I16);
        assert_eq!(layout.channels[1].offset, 180.0);
        assert_eq!(layout.record_size(), 6);
        assert_eq!(
            parse_declaration(&layout.to_declaration()).unwrap(),
            layout
        );
    }

    #[test]
    fn channel_without_scale_is_an_error() {
        assert_eq!(
            parse_declaration("TRF3;0.04;Gantry=i16:0.1"),
            Err(TrfHeaderError::MissingScale(String::from("Gantry")))
        );
        assert!(matches!(
            parse_declaration("TRF3;0.04;Gantry=f32:0.1:0"),
            Err(TrfHeaderError::UnknownChannelKind { .. })
        ));
        assert!(matches!(
            parse_declaration("XYZ;0.04;Gantry=i16:0.1:0"),
            Err(TrfHeaderError::BadDeclaration(_))
        ));
    }

    #[test]
    fn finds_the_header_length() {
        let mut contents =
            b"\t19/06/14 13:05:22 Z\t+10:00\tG1/6X\tLA1\tTRF3;0.04;A=i16:1:0;B=i16:1:0;C=i16:1:0"
                .to_vec();
        for marker in 0..3u8 {
            contents.extend_from_slice(&[TRF_DELIMITER, 0xdc, 0x00, 0xe0 + marker]);
        }
        contents.extend_from_slice(&[TRF_DELIMITER, 0xdc, 0x00]);
        let header_length = contents.len();
        contents.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(determine_header_length(&contents).unwrap(), header_length);
        assert_eq!(header_length_from_tokens(&contents).unwrap(), header_length);
        assert_eq!(
            determine_header_length(&contents[..header_length - 4]),
            Err(TrfHeaderError::HeaderLengthNotFound)
        );
    }

    #[test]
    fn table_may_start_with_the_delimiter_byte() {
        let mut contents =
            b"\t19/06/14 13:05:22 Z\t+10:00\tG1/6X\tLA1\tTRF3;0.04;A=i16:1:0".to_vec();
        contents.extend_from_slice(&[TRF_DELIMITER, 0xdc, 0x00, 0xe0]);
        contents.extend_from_slice(&[TRF_DELIMITER, 0xdc, 0x00]);
        let header_length = contents.len();
        contents.extend_from_slice(&[TRF_DELIMITER, 0x00, 0x0a, 0x00]);
        assert_eq!(determine_header_length(&contents).unwrap(), header_length);
    }

    #[test]
    fn markers_that_disagree_with_the_declaration_fall_back_to_tokens() {
        // Two channels declared but a single marker written
        let mut contents =
            b"\t19/06/14 13:05:22 Z\t+10:00\tG1/6X\tLA1\tTRF3;0.04;A=i16:1:0;B=i16:1:0".to_vec();
        contents.extend_from_slice(&[TRF_DELIMITER, 0xdc, 0x00, 0xe0]);
        contents.extend_from_slice(&[TRF_DELIMITER, 0xdc, 0x00]);
        let header_length = contents.len();
        contents.extend_from_slice(&[0x01, 0x00, 0x02, 0x00, 0x03, 0x00, 0x04, 0x00]);
        assert_eq!(header_length_from_layout(&contents), None);
        assert_eq!(determine_header_length(&contents).unwrap(), header_length);
    }
}
