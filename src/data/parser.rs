use tracing::warn;

use crate::error::{RecError, Result};
use crate::models::{ItemMetadata, RawInteraction, GENRE_DIM};

/// Per-file ingestion counters. Malformed lines are skipped, not fatal.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseStats {
    pub parsed: usize,
    pub skipped: usize,
}

/// Parse the tab-separated interaction log: `userId\titemId\trating\tts`.
///
/// Lines that fail to parse are skipped and counted; the call only fails if
/// nothing survives.
pub fn parse_interactions(name: &str, text: &str) -> Result<(Vec<RawInteraction>, ParseStats)> {
    let mut records = Vec::new();
    let mut stats = ParseStats::default();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_interaction_line(name, idx + 1, line) {
            Ok(record) => {
                records.push(record);
                stats.parsed += 1;
            }
            Err(e) => {
                warn!("skipping interaction record: {e}");
                stats.skipped += 1;
            }
        }
    }

    if records.is_empty() {
        return Err(RecError::EmptyInput {
            what: "interaction records",
        });
    }
    Ok((records, stats))
}

fn parse_interaction_line(file: &str, line_no: usize, line: &str) -> Result<RawInteraction> {
    let malformed = |reason: String| RecError::MalformedRecord {
        file: file.to_string(),
        line: line_no,
        reason,
    };

    let mut fields = line.split('\t');
    let mut next = |label: &str| {
        fields
            .next()
            .ok_or_else(|| malformed(format!("missing {label}")))
    };

    let user_id = next("userId")?
        .parse::<u32>()
        .map_err(|e| malformed(format!("invalid userId: {e}")))?;
    let item_id = next("itemId")?
        .parse::<u32>()
        .map_err(|e| malformed(format!("invalid itemId: {e}")))?;
    let rating = next("rating")?
        .parse::<u8>()
        .map_err(|e| malformed(format!("invalid rating: {e}")))?;
    let timestamp = next("timestamp")?
        .parse::<i64>()
        .map_err(|e| malformed(format!("invalid timestamp: {e}")))?;

    if !(1..=5).contains(&rating) {
        return Err(malformed(format!("rating {rating} outside 1..=5")));
    }

    Ok(RawInteraction {
        user_id,
        item_id,
        rating,
        timestamp,
    })
}

/// Parse the pipe-separated item catalog:
/// `itemId|title|releaseDate|videoReleaseDate|imdbUrl|flag_0|...|flag_18`.
pub fn parse_items(name: &str, text: &str) -> Result<(Vec<ItemMetadata>, ParseStats)> {
    let mut records = Vec::new();
    let mut stats = ParseStats::default();

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_item_line(name, idx + 1, line) {
            Ok(record) => {
                records.push(record);
                stats.parsed += 1;
            }
            Err(e) => {
                warn!("skipping item record: {e}");
                stats.skipped += 1;
            }
        }
    }

    if records.is_empty() {
        return Err(RecError::EmptyInput {
            what: "item records",
        });
    }
    Ok((records, stats))
}

fn parse_item_line(file: &str, line_no: usize, line: &str) -> Result<ItemMetadata> {
    let malformed = |reason: String| RecError::MalformedRecord {
        file: file.to_string(),
        line: line_no,
        reason,
    };

    let fields: Vec<&str> = line.split('|').collect();
    // 5 header fields (id, title, release date, video date, url) + genre flags.
    if fields.len() != 5 + GENRE_DIM {
        return Err(malformed(format!(
            "expected {} fields, found {}",
            5 + GENRE_DIM,
            fields.len()
        )));
    }

    let item_id = fields[0]
        .parse::<u32>()
        .map_err(|e| malformed(format!("invalid itemId: {e}")))?;

    let (title, release_year) = split_title_year(fields[1]);

    let mut genres = [0u8; GENRE_DIM];
    for (slot, raw) in genres.iter_mut().zip(&fields[5..]) {
        *slot = match raw.trim() {
            "0" => 0,
            "1" => 1,
            other => return Err(malformed(format!("invalid genre flag {other:?}"))),
        };
    }

    Ok(ItemMetadata {
        item_id,
        title,
        release_year,
        genres,
    })
}

/// Extract a trailing "(YYYY)" year annotation and strip it from the title.
fn split_title_year(raw: &str) -> (String, Option<u16>) {
    let raw = raw.trim();
    if let (Some(open), Some(close)) = (raw.rfind('('), raw.rfind(')')) {
        if open < close && close == raw.len() - 1 {
            if let Ok(year) = raw[open + 1..close].parse::<u16>() {
                return (raw[..open].trim_end().to_string(), Some(year));
            }
        }
    }
    (raw.to_string(), None)
}

/// Decode ISO-8859-1 bytes; every byte maps 1:1 to a code point.
pub fn decode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}
