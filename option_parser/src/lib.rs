// Copyright © 2020 Intel Corporation
// Copyright © 2024 The vmhost Authors
//
// SPDX-License-Identifier: Apache-2.0
//

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use thiserror::Error;

mod private_trait {
    // Voldemort trait that dispatches to `FromStr::from_str` on externally-defined types
    // and to custom parsing code for types in this module.
    pub trait Parseable
    where
        Self: Sized,
    {
        type Err;
        // Actually does the parsing, but panics if the input doesn't have
        // balanced quotes.  This is fine because split_commas checks that the
        // input has balanced quotes, and option names cannot contain anything
        // that split_commas treats as special.
        fn from_str(input: &str) -> Result<Self, <Self as Parseable>::Err>;
    }
}
use private_trait::Parseable;

#[derive(Default)]
pub struct OptionParser {
    options: HashMap<String, OptionParserValue>,
}

struct OptionParserValue {
    value: Option<String>,
}

#[derive(Error, Debug)]
pub enum OptionParserError {
    #[error("unknown option: {0}")]
    UnknownOption(String),
    #[error("invalid syntax: {0}")]
    InvalidSyntax(String),
    #[error("unable to convert {1} for {0}")]
    Conversion(String /* field */, String /* value */),
    #[error("invalid value: {0}")]
    InvalidValue(String),
}
type OptionParserResult<T> = std::result::Result<T, OptionParserError>;

fn split_commas(s: &str) -> OptionParserResult<Vec<String>> {
    let mut list: Vec<String> = Vec::new();
    let mut opened_brackets = 0u64;
    let mut in_quotes = false;
    let mut current = String::new();

    for c in s.trim().chars() {
        match c {
            // In quotes, only '"' is special
            '"' => in_quotes = !in_quotes,
            _ if in_quotes => {}
            '[' => opened_brackets += 1,
            ']' => {
                if opened_brackets < 1 {
                    return Err(OptionParserError::InvalidSyntax(s.to_owned()));
                }
                opened_brackets -= 1;
            }
            ',' if opened_brackets == 0 => {
                list.push(current);
                current = String::new();
                continue;
            }
            _ => {}
        };
        current.push(c);
    }
    list.push(current);

    if in_quotes || opened_brackets != 0 {
        return Err(OptionParserError::InvalidSyntax(s.to_owned()));
    }

    Ok(list)
}

impl OptionParser {
    pub fn new() -> Self {
        Self {
            options: HashMap::new(),
        }
    }

    pub fn parse(&mut self, input: &str) -> OptionParserResult<()> {
        if input.trim().is_empty() {
            return Ok(());
        }

        for option in split_commas(input)?.iter() {
            let parts: Vec<&str> = option.splitn(2, '=').collect();
            match self.options.get_mut(parts[0]) {
                None => return Err(OptionParserError::UnknownOption(parts[0].to_owned())),
                Some(value) => {
                    if parts.len() != 2 {
                        return Err(OptionParserError::InvalidSyntax((*option).to_owned()));
                    }
                    value.value = Some(parts[1].trim().to_owned());
                }
            }
        }

        Ok(())
    }

    pub fn add(&mut self, option: &str) -> &mut Self {
        // Check that option=value has balanced
        // quotes and brackets iff value does.
        assert!(
            !option.contains(['"', '[', ']', '=', ',']),
            "forbidden character in option name"
        );
        self.options.insert(
            option.to_owned(),
            OptionParserValue { value: None },
        );

        self
    }

    pub fn get(&self, option: &str) -> Option<String> {
        self.options
            .get(option)
            .and_then(|v| v.value.clone())
            .and_then(|s| {
                if s.is_empty() {
                    None
                } else {
                    Some(dequote(&s))
                }
            })
    }

    pub fn is_set(&self, option: &str) -> bool {
        self.options
            .get(option)
            .and_then(|v| v.value.as_ref())
            .is_some()
    }

    pub fn convert<T: Parseable>(&self, option: &str) -> OptionParserResult<Option<T>> {
        match self.options.get(option).and_then(|v| v.value.as_ref()) {
            None => Ok(None),
            Some(v) => {
                Ok(if v.is_empty() {
                    None
                } else {
                    Some(Parseable::from_str(v).map_err(|_| {
                        OptionParserError::Conversion(option.to_owned(), v.to_owned())
                    })?)
                })
            }
        }
    }
}

pub struct Toggle(pub bool);

#[derive(Error, Debug)]
pub enum ToggleParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

impl Parseable for Toggle {
    type Err = ToggleParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "" => Ok(Toggle(false)),
            "on" => Ok(Toggle(true)),
            "off" => Ok(Toggle(false)),
            "true" => Ok(Toggle(true)),
            "false" => Ok(Toggle(false)),
            _ => Err(ToggleParseError::InvalidValue(s.to_owned())),
        }
    }
}

/// A set of logical CPU ids in kernel list notation (`0-3,8,10-11`).
///
/// Parsing expands ranges and yields the ids sorted and deduplicated, so
/// `CpuList::from_str(&list.to_string())` always gives back the same set.
#[derive(Clone, Debug, Default, PartialEq, Eq, serde::Serialize)]
pub struct CpuList(pub Vec<u32>);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CpuListParseError {
    #[error("invalid cpu id: {0}")]
    InvalidId(String),
    #[error("invalid cpu range: {0}")]
    InvalidRange(String),
}

impl CpuList {
    /// Builds a list from arbitrary ids, sorting and removing duplicates.
    pub fn new(mut ids: Vec<u32>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        CpuList(ids)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, id: u32) -> bool {
        self.0.binary_search(&id).is_ok()
    }
}

impl FromStr for CpuList {
    type Err = CpuListParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut ids = Vec::new();
        let body = s.trim().trim_matches(|c| c == '[' || c == ']');
        if body.trim().is_empty() {
            return Ok(CpuList::default());
        }

        for item in body.split(',') {
            let item = item.trim();
            match item.split_once('-') {
                Some((start, end)) => {
                    let start = start
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| CpuListParseError::InvalidRange(item.to_owned()))?;
                    let end = end
                        .trim()
                        .parse::<u32>()
                        .map_err(|_| CpuListParseError::InvalidRange(item.to_owned()))?;
                    if start > end {
                        return Err(CpuListParseError::InvalidRange(item.to_owned()));
                    }
                    ids.extend(start..=end);
                }
                None => ids.push(
                    item.parse::<u32>()
                        .map_err(|_| CpuListParseError::InvalidId(item.to_owned()))?,
                ),
            }
        }

        Ok(CpuList::new(ids))
    }
}

impl fmt::Display for CpuList {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut ids = self.0.clone();
        ids.sort_unstable();
        ids.dedup();

        let mut iter = ids.into_iter();
        let Some(first) = iter.next() else {
            return Ok(());
        };

        let mut ranges = Vec::new();
        let (mut start, mut prev) = (first, first);
        for id in iter {
            if id == prev + 1 {
                prev = id;
                continue;
            }
            ranges.push((start, prev));
            start = id;
            prev = id;
        }
        ranges.push((start, prev));

        for (i, (start, end)) in ranges.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }

        Ok(())
    }
}

/// Huge page size held in KiB and rendered in the largest exact unit.
///
/// Accepts `2M`, `2048K`, `2048 kB`, `1GiB`: a positive integer followed by
/// a K, M or G unit, optionally suffixed with `B` or `iB`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct HugePageSize(pub u64);

#[derive(Error, Debug, PartialEq, Eq)]
pub enum HugePageSizeParseError {
    #[error("expected a size like 2M or 1G: {0}")]
    InvalidFormat(String),
    #[error("size must be a positive integer: {0}")]
    InvalidNumber(String),
    #[error("unsupported size unit {0} (use K, M, or G)")]
    InvalidUnit(String),
}

impl HugePageSize {
    pub fn kib(&self) -> u64 {
        self.0
    }
}

impl FromStr for HugePageSize {
    type Err = HugePageSizeParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split_whitespace().collect();
        let (number, unit) = match parts.as_slice() {
            [token] => {
                let idx = token
                    .find(|c: char| !c.is_ascii_digit())
                    .ok_or_else(|| HugePageSizeParseError::InvalidFormat(s.to_owned()))?;
                token.split_at(idx)
            }
            [number, unit] => (*number, *unit),
            _ => return Err(HugePageSizeParseError::InvalidFormat(s.to_owned())),
        };
        if number.is_empty() {
            return Err(HugePageSizeParseError::InvalidFormat(s.to_owned()));
        }

        let n = number
            .parse::<u64>()
            .map_err(|_| HugePageSizeParseError::InvalidNumber(number.to_owned()))?;
        if n == 0 {
            return Err(HugePageSizeParseError::InvalidNumber(number.to_owned()));
        }

        let upper = unit.trim().to_uppercase();
        let upper = upper.strip_suffix("IB").unwrap_or(&upper);
        let upper = upper.strip_suffix('B').unwrap_or(upper);
        let shift = match upper {
            "K" => 0,
            "M" => 10,
            "G" => 20,
            _ => return Err(HugePageSizeParseError::InvalidUnit(unit.to_owned())),
        };

        n.checked_shl(shift)
            .filter(|kib| kib >> shift == n)
            .map(HugePageSize)
            .ok_or_else(|| HugePageSizeParseError::InvalidNumber(number.to_owned()))
    }
}

impl fmt::Display for HugePageSize {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let kib = self.0;
        if kib != 0 && kib % (1 << 20) == 0 {
            write!(f, "{}G", kib >> 20)
        } else if kib != 0 && kib % (1 << 10) == 0 {
            write!(f, "{}M", kib >> 10)
        } else {
            write!(f, "{kib}K")
        }
    }
}

pub trait TupleValue {
    fn parse_value(input: &str) -> Result<Self, TupleError>
    where
        Self: Sized;
}

impl TupleValue for Vec<u32> {
    fn parse_value(input: &str) -> Result<Self, TupleError> {
        Ok(input
            .parse::<CpuList>()
            .map_err(TupleError::InvalidIntegerList)?
            .0)
    }
}

impl TupleValue for Vec<usize> {
    fn parse_value(input: &str) -> Result<Self, TupleError> {
        Ok(input
            .parse::<CpuList>()
            .map_err(TupleError::InvalidIntegerList)?
            .0
            .iter()
            .map(|v| *v as usize)
            .collect())
    }
}

#[derive(PartialEq, Eq, Debug)]
pub struct Tuple<S, T>(pub Vec<(S, T)>);

#[derive(Error, Debug)]
pub enum TupleError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
    #[error("split outside brackets")]
    SplitOutsideBrackets(#[source] OptionParserError),
    #[error("invalid integer list")]
    InvalidIntegerList(#[source] CpuListParseError),
}

impl<S: Parseable, T: TupleValue> Parseable for Tuple<S, T> {
    type Err = TupleError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut list: Vec<(S, T)> = Vec::new();
        let body = s
            .trim()
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| TupleError::InvalidValue(s.to_string()))?;
        let tuples_list = split_commas(body).map_err(TupleError::SplitOutsideBrackets)?;
        for tuple in tuples_list.iter() {
            let mut in_quotes = false;
            let mut last_idx = 0;
            let mut first_val = None;
            for (idx, c) in tuple.as_bytes().iter().enumerate() {
                match c {
                    b'"' => in_quotes = !in_quotes,
                    b'@' if !in_quotes => {
                        if last_idx != 0 {
                            return Err(TupleError::InvalidValue((*tuple).to_string()));
                        }
                        first_val = Some(&tuple[last_idx..idx]);
                        last_idx = idx + 1;
                    }
                    _ => {}
                }
            }
            let first_val = first_val.ok_or(TupleError::InvalidValue((*tuple).to_string()))?;
            let item1 = <S as Parseable>::from_str(first_val)
                .map_err(|_| TupleError::InvalidValue(first_val.to_owned()))?;
            let item2 = TupleValue::parse_value(&tuple[last_idx..])?;
            list.push((item1, item2));
        }

        Ok(Tuple(list))
    }
}

#[derive(Default)]
pub struct StringList(pub Vec<String>);

#[derive(Error, Debug)]
pub enum StringListParseError {
    #[error("invalid value: {0}")]
    InvalidValue(String),
}

fn dequote(s: &str) -> String {
    let mut prev_byte = b'\0';
    let mut in_quotes = false;
    let mut out: Vec<u8> = vec![];
    for i in s.bytes() {
        if i == b'"' {
            if prev_byte == b'"' && !in_quotes {
                out.push(b'"');
            }
            in_quotes = !in_quotes;
        } else {
            out.push(i);
        }
        prev_byte = i
    }
    assert!(!in_quotes, "split_commas didn't reject unbalanced quotes");
    // SAFETY: the non-ASCII bytes in the output are the same
    // and in the same order as those in the input, so if the
    // input is valid UTF-8 the output will be as well.
    unsafe { String::from_utf8_unchecked(out) }
}

impl<T> Parseable for T
where
    T: FromStr + Sized,
{
    type Err = <T as FromStr>::Err;
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        dequote(s).parse()
    }
}

impl Parseable for StringList {
    type Err = StringListParseError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let string_list: Vec<String> =
            split_commas(s.trim().trim_matches(|c| c == '[' || c == ']'))
                .map_err(|_| StringListParseError::InvalidValue(s.to_owned()))?
                .iter()
                .map(|e| e.to_owned())
                .collect();

        Ok(StringList(string_list))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_option_parser() {
        let mut parser = OptionParser::new();
        parser
            .add("socket")
            .add("start")
            .add("end")
            .add("ht")
            .add("cores")
            .add("features");

        assert_eq!(split_commas("\"\"").unwrap(), vec!["\"\""]);
        parser.parse("socket=0,hanging_param").unwrap_err();
        parser.parse("socket=0,too_many_equals=foo=bar").unwrap_err();
        parser.parse("socket=0,file=/dev/shm").unwrap_err();

        parser.parse("socket=1").unwrap();
        assert_eq!(parser.get("socket"), Some("1".to_owned()));
        assert!(!parser.is_set("ht"));
        assert!(parser.is_set("socket"));
        parser.parse("socket=").unwrap();
        assert!(parser.get("socket").is_none());

        parser.parse("socket=0,start=0,end=3,ht=on").unwrap();
        assert_eq!(parser.convert::<u32>("end").unwrap(), Some(3));
        assert!(parser.convert::<Toggle>("ht").unwrap().unwrap().0);

        parser.parse("cores=[0@[0,1],1@[2-3]]").unwrap();
        assert_eq!(
            parser
                .convert::<Tuple<u32, Vec<u32>>>("cores")
                .unwrap()
                .unwrap(),
            Tuple(vec![(0, vec![0, 1]), (1, vec![2, 3])])
        );
        parser.parse("cores=[").unwrap_err();

        parser.parse("features=[vmx,\"svm\"]").unwrap();
        let features = parser.convert::<StringList>("features").unwrap().unwrap();
        assert_eq!(features.0, vec!["vmx", "\"svm\""]);
    }

    #[test]
    fn test_cpu_list() {
        let list: CpuList = "0-3,8,10-11".parse().unwrap();
        assert_eq!(list.0, vec![0, 1, 2, 3, 8, 10, 11]);
        assert_eq!(list.to_string(), "0-3,8,10-11");

        let list: CpuList = "5, 1,3-4,1".parse().unwrap();
        assert_eq!(list.0, vec![1, 3, 4, 5]);
        assert_eq!(list.to_string(), "1,3-5");

        assert_eq!(CpuList::new(vec![7, 6]).to_string(), "6-7");
        assert_eq!(CpuList::new(vec![9]).to_string(), "9");
        assert_eq!("".parse::<CpuList>().unwrap(), CpuList::default());
        assert_eq!(CpuList::default().to_string(), "");

        assert!(matches!(
            "4-2".parse::<CpuList>(),
            Err(CpuListParseError::InvalidRange(_))
        ));
        assert!(matches!(
            "1,x".parse::<CpuList>(),
            Err(CpuListParseError::InvalidId(_))
        ));
    }

    #[test]
    fn test_cpu_list_compress_expand() {
        let sets: [&[u32]; 5] = [
            &[0],
            &[3, 1, 2, 2, 0],
            &[31, 0, 16, 17, 18, 5, 7],
            &[100, 99, 98, 1, 50],
            &[2, 4, 6, 8, 9, 10],
        ];
        for set in sets {
            let mut expected = set.to_vec();
            expected.sort_unstable();
            expected.dedup();
            let compressed = CpuList::new(set.to_vec()).to_string();
            assert_eq!(compressed.parse::<CpuList>().unwrap().0, expected);
        }
    }

    #[test]
    fn test_hugepage_size() {
        let cases = [
            ("2M", "2M"),
            ("2048K", "2M"),
            ("2048 kB", "2M"),
            ("1GiB", "1G"),
            ("1048576 kB", "1G"),
            ("512k", "512K"),
            ("1536M", "1536M"),
        ];
        for (input, expected) in cases {
            assert_eq!(
                input.parse::<HugePageSize>().unwrap().to_string(),
                expected,
                "{input}"
            );
        }

        assert_eq!("2M".parse::<HugePageSize>().unwrap().kib(), 2048);
        assert!(matches!(
            "0M".parse::<HugePageSize>(),
            Err(HugePageSizeParseError::InvalidNumber(_))
        ));
        assert!(matches!(
            "2T".parse::<HugePageSize>(),
            Err(HugePageSizeParseError::InvalidUnit(_))
        ));
        assert!(matches!(
            "2048".parse::<HugePageSize>(),
            Err(HugePageSizeParseError::InvalidFormat(_))
        ));
        assert!(matches!(
            "M".parse::<HugePageSize>(),
            Err(HugePageSizeParseError::InvalidFormat(_))
        ));
    }

    #[test]
    fn parse_quoted_string() {
        assert_eq!(<String as Parseable>::from_str("a=\"b\"").unwrap(), "a=b");
    }

    #[test]
    fn check_dequote() {
        assert_eq!(dequote("a\u{3b2}\"a\"\"\""), "a\u{3b2}a\"")
    }
}
