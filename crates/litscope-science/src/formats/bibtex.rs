//! BibTeX reading and writing.
//!
//! The reader handles `@string` macros, `#` concatenation, braced and quoted
//! values with nesting, and skips `@comment`/`@preamble`. Broken entries are
//! reported with their line and parsing resumes at the next `@`.

use std::collections::{BTreeMap, HashMap};

use litscope_core::models::fields;
use litscope_core::Record;
use nom::{
    branch::alt,
    bytes::complete::take_while1,
    character::complete::{char, multispace0},
    combinator::map,
    sequence::{delimited, preceded, tuple},
    IResult,
};

use crate::error::ScienceError;

/// One `@type{key, ...}` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BibEntry {
    pub entrytype: String,
    pub key: String,
    pub fields: Vec<(String, String)>,
    pub line: u32,
}

impl BibEntry {
    /// Flat mapping with lowercased field names plus `ID` and `ENTRYTYPE`,
    /// as accepted by [`Record::from_map`].
    pub fn into_map(self) -> BTreeMap<String, String> {
        let mut map: BTreeMap<String, String> = self
            .fields
            .into_iter()
            .map(|(k, v)| {
                let k = k.to_lowercase();
                let v = if fields::is_reserved(&k) { v } else { clean_value(&v) };
                (k, v)
            })
            .filter(|(_, v)| !v.is_empty())
            .collect();
        map.insert(fields::ID.to_string(), self.key);
        map.insert(fields::ENTRYTYPE.to_string(), self.entrytype.to_lowercase());
        map
    }
}

#[derive(Debug, Default)]
pub struct BibFile {
    pub entries: Vec<BibEntry>,
    pub errors: Vec<ScienceError>,
}

/// Collapses whitespace and drops a single pair of protective outer braces.
fn clean_value(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    match collapsed.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
        Some(inner) if !inner.contains(['{', '}']) => inner.to_string(),
        _ => collapsed,
    }
}

// ─── Reader ────────────────────────────────────────────────

pub fn parse(input: &str) -> BibFile {
    let mut file = BibFile::default();
    let mut strings: HashMap<String, String> = HashMap::new();
    let mut rest = input;

    while let Some(at) = rest.find('@') {
        let line = line_of(input, &rest[at..]);
        let block = &rest[at..];
        match at_block(block, &strings) {
            Ok((after, parsed)) => {
                match parsed {
                    Block::Entry(mut entry) => {
                        entry.line = line;
                        file.entries.push(entry);
                    }
                    Block::Macro(name, value) => {
                        strings.insert(name.to_lowercase(), value);
                    }
                    Block::Skipped => {}
                }
                rest = after;
            }
            Err(_) => {
                file.errors.push(ScienceError::Bibtex {
                    line,
                    message: "malformed entry".to_string(),
                });
                rest = &block[1..];
            }
        }
    }
    file
}

fn line_of(input: &str, tail: &str) -> u32 {
    let offset = input.len() - tail.len();
    input[..offset].matches('\n').count() as u32 + 1
}

enum Block {
    Entry(BibEntry),
    Macro(String, String),
    Skipped,
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_alphanumeric() || "_-:./+".contains(c))(input)
}

fn at_block<'a>(input: &'a str, strings: &HashMap<String, String>) -> IResult<&'a str, Block> {
    let (rest, kind) = preceded(char('@'), preceded(multispace0, identifier))(input)?;
    match kind.to_lowercase().as_str() {
        "comment" | "preamble" => {
            let (rest, _) = preceded(multispace0, braced)(rest)?;
            Ok((rest, Block::Skipped))
        }
        "string" => {
            let (rest, (name, value)) = delimited(
                preceded(multispace0, char('{')),
                |i| field(i, strings),
                preceded(multispace0, char('}')),
            )(rest)?;
            Ok((rest, Block::Macro(name, value)))
        }
        _ => {
            let (rest, (_, _, key, _, _)) =
                tuple((multispace0, char('{'), preceded(multispace0, identifier), multispace0, char(',')))(rest)?;
            let (rest, fields) = field_list(rest, strings)?;
            let (rest, _) = preceded(multispace0, char('}'))(rest)?;
            Ok((
                rest,
                Block::Entry(BibEntry {
                    entrytype: kind.to_lowercase(),
                    key: key.to_string(),
                    fields,
                    line: 0,
                }),
            ))
        }
    }
}

fn field_list<'a>(mut input: &'a str, strings: &HashMap<String, String>) -> IResult<&'a str, Vec<(String, String)>> {
    let mut out = Vec::new();
    loop {
        let (rest, _) = multispace0(input)?;
        if rest.starts_with('}') {
            return Ok((rest, out));
        }
        let (rest, pair) = field(rest, strings)?;
        out.push(pair);
        let (rest, _) = multispace0(rest)?;
        input = rest.strip_prefix(',').unwrap_or(rest);
    }
}

fn field<'a>(input: &'a str, strings: &HashMap<String, String>) -> IResult<&'a str, (String, String)> {
    let (rest, name) = preceded(multispace0, identifier)(input)?;
    let (rest, _) = preceded(multispace0, char('='))(rest)?;
    let (rest, value) = value(rest, strings)?;
    Ok((rest, (name.to_string(), value)))
}

/// Parts joined with `#`.
fn value<'a>(mut input: &'a str, strings: &HashMap<String, String>) -> IResult<&'a str, String> {
    let mut out = String::new();
    loop {
        let (rest, part) = preceded(
            multispace0,
            alt((
                map(braced, |s: &str| s[1..s.len() - 1].to_string()),
                quoted,
                map(identifier, |s: &str| {
                    strings.get(&s.to_lowercase()).cloned().unwrap_or_else(|| s.to_string())
                }),
            )),
        )(input)?;
        out.push_str(&part);
        let (rest, _) = multispace0(rest)?;
        match rest.strip_prefix('#') {
            Some(next) => input = next,
            None => return Ok((rest, out)),
        }
    }
}

fn fail(input: &str) -> nom::Err<nom::error::Error<&str>> {
    nom::Err::Error(nom::error::Error::new(input, nom::error::ErrorKind::Char))
}

/// `{...}` with nesting; returns the braces too.
fn braced(input: &str) -> IResult<&str, &str> {
    if !input.starts_with('{') {
        return Err(fail(input));
    }
    let mut depth = 0usize;
    let mut escaped = false;
    for (idx, c) in input.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok((&input[idx + 1..], &input[..=idx]));
                }
            }
            _ => {}
        }
    }
    Err(fail(input))
}

fn quoted(input: &str) -> IResult<&str, String> {
    let Some(body) = input.strip_prefix('"') else {
        return Err(fail(input));
    };
    let mut depth = 0usize;
    let mut escaped = false;
    for (idx, c) in body.char_indices() {
        match c {
            _ if escaped => escaped = false,
            '\\' => escaped = true,
            '{' => depth += 1,
            '}' => depth = depth.saturating_sub(1),
            '"' if depth == 0 => return Ok((&body[idx + 1..], body[..idx].to_string())),
            _ => {}
        }
    }
    Err(fail(input))
}

// ─── Writer ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOptions {
    /// Keep `status`, `origin` and the provenance maps so the file can be
    /// read back into records.
    pub include_reserved: bool,
}

pub fn write_records<'a, I>(records: I, opts: WriteOptions) -> String
where
    I: IntoIterator<Item = &'a Record>,
{
    records
        .into_iter()
        .map(|r| write_record(r, opts))
        .collect::<Vec<_>>()
        .join("\n")
}

pub fn write_record(record: &Record, opts: WriteOptions) -> String {
    let map = record.to_map();
    let mut out = format!("@{}{{{},\n", record.entrytype, record.id);

    let reserved = [
        fields::ORIGIN,
        fields::STATUS,
        fields::MASTERDATA_PROVENANCE,
        fields::DATA_PROVENANCE,
    ];
    let width = map.keys().map(String::len).max().unwrap_or(0);
    let mut push = |key: &str, value: &str| {
        out.push_str(&format!("   {key:<width$} = {{{value}}},\n"));
    };

    if opts.include_reserved {
        for key in reserved {
            if let Some(value) = map.get(key) {
                push(key, value);
            }
        }
    }
    for (key, value) in &map {
        if key == fields::ID || key == fields::ENTRYTYPE || fields::is_reserved(key) {
            continue;
        }
        push(key, value);
    }
    out.push_str("}\n");
    out
}
