//! Reuse-distance data files.
//!
//! The profiler writes its results as a sequence of assignment statements:
//!
//! ```text
//! #librda version 1a2b3c
//! simStacks = {}
//! #rddata simStacks[0] = {'histogram':{0:4, 1.000000:10, 9223372036854775808.000000:3}, 'attributes':{...}}
//! #preds { 512: [3, 4, ], 'accesses': [5, 5, ]}
//! PCDist = {0x400514:(120,18,{1.000000:(10,1.0), 9223372036854775808.000000:3}), }
//! import collections
//! LME = collections.namedtuple('LME', 'name base top')
//! LibraryMap = [LME('bench',0x400000,0x4fffff),]
//! ```
//!
//! Statements are parsed by a small recursive-descent parser into [`Value`]s stored in a
//! namespace; nothing is evaluated beyond literals, name references, subscripts and record
//! construction. A malformed line is logged and skipped.

use crate::core::{DistanceKey, ThreadId};
use crate::error::{AnalysisError, Result};
use crate::histogram::{
    CurrentThreadRecord, LegacyThreadRecord, ReferenceKind, ReuseProfile, ThreadAttributes,
    ThreadHistogram, ThreadRecord,
};
use crate::input::for_each_line;
use crate::library_map::{ImageRange, LibraryMap};
use crate::pc_profile::{PcBucket, PcProfile, PcRecord};
use crate::predictions::IntervalPredictions;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::path::Path;
use tracing::{debug, info, warn};

/// A parsed literal.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    None,
    Bool(bool),
    Int(i128),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Tuple(Vec<Value>),
    /// Entries in source order; keys compare numerically across ints and floats and a repeated
    /// key shadows earlier ones on lookup.
    Dict(Vec<(Value, Value)>),
    /// Declaration of a named record type (`collections.namedtuple('T', 'a b')`).
    RecordType { name: String, fields: Vec<String> },
    Record {
        type_name: String,
        fields: Vec<(String, Value)>,
    },
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Int(i) => u64::try_from(*i).ok(),
            Value::Float(f) if *f >= 0.0 && f.fract() == 0.0 && *f <= u64::MAX as f64 => {
                Some(*f as u64)
            }
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Python-style key equality: `1 == 1.0`, other kinds compare structurally.
    fn key_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Int(_) | Value::Float(_), Value::Int(_) | Value::Float(_)) => {
                self.as_f64() == other.as_f64()
            }
            (Value::Tuple(a), Value::Tuple(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.key_eq(y))
            }
            _ => self == other,
        }
    }

    /// Dict entry by key, sequence element by integer index, or record field by position.
    pub fn get(&self, key: &Value) -> Option<&Value> {
        match self {
            Value::Dict(entries) => entries
                .iter()
                .rev()
                .find(|(k, _)| k.key_eq(key))
                .map(|(_, v)| v),
            Value::List(items) | Value::Tuple(items) => {
                sequence_index(items.len(), key).map(|i| &items[i])
            }
            Value::Record { fields, .. } => {
                sequence_index(fields.len(), key).map(|i| &fields[i].1)
            }
            _ => None,
        }
    }

    pub fn get_str(&self, key: &str) -> Option<&Value> {
        self.get(&Value::Str(key.to_string()))
    }

    /// Named field of a record.
    pub fn field(&self, name: &str) -> Option<&Value> {
        match self {
            Value::Record { fields, .. } => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    fn get_mut(&mut self, key: &Value) -> Option<&mut Value> {
        match self {
            Value::Dict(entries) => entries
                .iter_mut()
                .rev()
                .find(|(k, _)| k.key_eq(key))
                .map(|(_, v)| v),
            Value::List(items) => {
                let i = sequence_index(items.len(), key)?;
                items.get_mut(i)
            }
            _ => None,
        }
    }

    /// Python-style subscript assignment.
    fn set(&mut self, key: Value, value: Value) -> std::result::Result<(), String> {
        match self {
            Value::Dict(entries) => {
                match entries.iter_mut().rev().find(|(k, _)| k.key_eq(&key)) {
                    Some(entry) => entry.1 = value,
                    None => entries.push((key, value)),
                }
                Ok(())
            }
            Value::List(items) => {
                let i = sequence_index(items.len(), &key)
                    .ok_or_else(|| format!("list index {key:?} out of range"))?;
                items[i] = value;
                Ok(())
            }
            other => Err(format!("cannot assign into {}", other.kind())),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::None => "None",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Tuple(_) => "tuple",
            Value::Dict(_) => "dict",
            Value::RecordType { .. } => "record type",
            Value::Record { .. } => "record",
        }
    }
}

fn sequence_index(len: usize, key: &Value) -> Option<usize> {
    let Value::Int(i) = key else {
        return None;
    };
    let idx = if *i < 0 { len as i128 + i } else { *i };
    usize::try_from(idx).ok().filter(|i| *i < len)
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Int(i128),
    Float(f64),
    Str(String),
    Ident(String),
    Punct(char),
}

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
        } else if c.is_ascii_digit() || (c == '.' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) {
            let (token, next) = lex_number(&chars, i)?;
            tokens.push(token);
            i = next;
        } else if c == '\'' || c == '"' {
            let (text, next) = lex_string(&chars, i)?;
            tokens.push(Token::Str(text));
            i = next;
        } else if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                i += 1;
            }
            tokens.push(Token::Ident(chars[start..i].iter().collect()));
        } else if "[]{}(),:=.-+".contains(c) {
            tokens.push(Token::Punct(c));
            i += 1;
        } else {
            return Err(format!("unexpected character {c:?}"));
        }
    }
    Ok(tokens)
}

fn lex_number(chars: &[char], start: usize) -> std::result::Result<(Token, usize), String> {
    let mut i = start;
    if chars[i] == '0' && matches!(chars.get(i + 1), Some('x' | 'X')) {
        i += 2;
        let digits_start = i;
        while i < chars.len() && chars[i].is_ascii_hexdigit() {
            i += 1;
        }
        let digits: String = chars[digits_start..i].iter().collect();
        let value = i128::from_str_radix(&digits, 16)
            .map_err(|e| format!("bad hex literal 0x{digits}: {e}"))?;
        return Ok((Token::Int(value), skip_long_suffix(chars, i)));
    }
    let mut is_float = false;
    while i < chars.len() {
        let c = chars[i];
        if c.is_ascii_digit() {
            i += 1;
        } else if c == '.' {
            is_float = true;
            i += 1;
        } else if (c == 'e' || c == 'E')
            && chars
                .get(i + 1)
                .is_some_and(|n| n.is_ascii_digit() || *n == '-' || *n == '+')
        {
            is_float = true;
            i += 2;
        } else {
            break;
        }
    }
    let text: String = chars[start..i].iter().collect();
    if is_float {
        let value = text
            .parse::<f64>()
            .map_err(|e| format!("bad float literal {text}: {e}"))?;
        Ok((Token::Float(value), i))
    } else {
        let value = text
            .parse::<i128>()
            .map_err(|e| format!("bad integer literal {text}: {e}"))?;
        Ok((Token::Int(value), skip_long_suffix(chars, i)))
    }
}

fn skip_long_suffix(chars: &[char], i: usize) -> usize {
    match chars.get(i) {
        Some('L' | 'l') => i + 1,
        _ => i,
    }
}

fn lex_string(chars: &[char], start: usize) -> std::result::Result<(String, usize), String> {
    let quote = chars[start];
    let mut text = String::new();
    let mut i = start + 1;
    while i < chars.len() {
        match chars[i] {
            c if c == quote => return Ok((text, i + 1)),
            '\\' => {
                let escaped = chars.get(i + 1).ok_or("unterminated escape")?;
                text.push(match escaped {
                    'n' => '\n',
                    't' => '\t',
                    other => *other,
                });
                i += 2;
            }
            c => {
                text.push(c);
                i += 1;
            }
        }
    }
    Err("unterminated string".to_string())
}

type Namespace = BTreeMap<String, Value>;

/// Assignment target: a name plus zero or more evaluated subscripts.
#[derive(Clone, Debug, PartialEq)]
struct Target {
    name: String,
    keys: Vec<Value>,
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    namespace: &'a Namespace,
}

impl<'a> Parser<'a> {
    fn new(src: &str, namespace: &'a Namespace) -> std::result::Result<Self, String> {
        Ok(Self {
            tokens: tokenize(src)?,
            pos: 0,
            namespace,
        })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn peek_punct(&self, c: char) -> bool {
        self.peek() == Some(&Token::Punct(c))
    }

    fn expect_punct(&mut self, c: char) -> std::result::Result<(), String> {
        match self.next() {
            Some(Token::Punct(p)) if p == c => Ok(()),
            other => Err(format!("expected '{c}', found {other:?}")),
        }
    }

    fn expect_end(&self) -> std::result::Result<(), String> {
        match self.peek() {
            None => Ok(()),
            Some(token) => Err(format!("trailing input at {token:?}")),
        }
    }

    fn statement(&mut self) -> std::result::Result<Option<(Target, Value)>, String> {
        if self.peek() == Some(&Token::Ident("import".into())) {
            return Ok(None);
        }
        let name = match self.next() {
            Some(Token::Ident(name)) => name,
            other => return Err(format!("expected assignment target, found {other:?}")),
        };
        let mut keys = Vec::new();
        while self.peek_punct('[') {
            self.next();
            keys.push(self.expr()?);
            self.expect_punct(']')?;
        }
        self.expect_punct('=')?;
        let value = self.expr()?;
        self.expect_end()?;
        Ok(Some((Target { name, keys }, value)))
    }

    fn expr(&mut self) -> std::result::Result<Value, String> {
        let value = match self.next() {
            Some(Token::Punct('-')) => match self.expr()? {
                Value::Int(i) => Value::Int(-i),
                Value::Float(f) => Value::Float(-f),
                other => return Err(format!("cannot negate {}", other.kind())),
            },
            Some(Token::Punct('+')) => match self.expr()? {
                v @ (Value::Int(_) | Value::Float(_)) => v,
                other => return Err(format!("unary plus on {}", other.kind())),
            },
            Some(Token::Int(i)) => Value::Int(i),
            Some(Token::Float(f)) => Value::Float(f),
            Some(Token::Str(s)) => Value::Str(s),
            Some(Token::Punct('[')) => Value::List(self.sequence(']')?),
            Some(Token::Punct('(')) => self.parenthesized()?,
            Some(Token::Punct('{')) => self.dict()?,
            Some(Token::Ident(name)) => self.name(name)?,
            other => return Err(format!("unexpected token {other:?}")),
        };
        self.subscripts(value)
    }

    fn subscripts(&mut self, mut value: Value) -> std::result::Result<Value, String> {
        while self.peek_punct('[') {
            self.next();
            let key = self.expr()?;
            self.expect_punct(']')?;
            value = value
                .get(&key)
                .cloned()
                .ok_or_else(|| format!("key {key:?} not found in {}", value.kind()))?;
        }
        Ok(value)
    }

    fn sequence(&mut self, close: char) -> std::result::Result<Vec<Value>, String> {
        let mut items = Vec::new();
        loop {
            if self.peek_punct(close) {
                self.next();
                return Ok(items);
            }
            items.push(self.expr()?);
            if self.peek_punct(',') {
                self.next();
            } else {
                self.expect_punct(close)?;
                return Ok(items);
            }
        }
    }

    fn parenthesized(&mut self) -> std::result::Result<Value, String> {
        let mut items = Vec::new();
        let mut saw_comma = false;
        loop {
            if self.peek_punct(')') {
                self.next();
                break;
            }
            items.push(self.expr()?);
            if self.peek_punct(',') {
                self.next();
                saw_comma = true;
            } else {
                self.expect_punct(')')?;
                break;
            }
        }
        if items.len() == 1 && !saw_comma {
            return Ok(items.remove(0));
        }
        Ok(Value::Tuple(items))
    }

    fn dict(&mut self) -> std::result::Result<Value, String> {
        let mut entries: Vec<(Value, Value)> = Vec::new();
        loop {
            if self.peek_punct('}') {
                self.next();
                break;
            }
            let key = self.expr()?;
            self.expect_punct(':')?;
            let value = self.expr()?;
            entries.push((key, value));
            if self.peek_punct(',') {
                self.next();
            } else {
                self.expect_punct('}')?;
                break;
            }
        }
        Ok(Value::Dict(entries))
    }

    fn name(&mut self, name: String) -> std::result::Result<Value, String> {
        match name.as_str() {
            "None" => return Ok(Value::None),
            "True" => return Ok(Value::Bool(true)),
            "False" => return Ok(Value::Bool(false)),
            "nan" => return Ok(Value::Float(f64::NAN)),
            "inf" => return Ok(Value::Float(f64::INFINITY)),
            _ => {}
        }
        if self.peek_punct('.') {
            self.next();
            let attr = match self.next() {
                Some(Token::Ident(attr)) => attr,
                other => return Err(format!("expected attribute name, found {other:?}")),
            };
            if name != "collections" || attr != "namedtuple" {
                return Err(format!("unsupported call {name}.{attr}"));
            }
            self.expect_punct('(')?;
            let args = self.sequence(')')?;
            return match args.as_slice() {
                [Value::Str(type_name), Value::Str(fields)] => Ok(Value::RecordType {
                    name: type_name.clone(),
                    fields: fields
                        .split(|c: char| c == ',' || c.is_whitespace())
                        .filter(|f| !f.is_empty())
                        .map(str::to_string)
                        .collect(),
                }),
                _ => Err("namedtuple expects a type name and a field list".to_string()),
            };
        }
        let namespace = self.namespace;
        let bound = namespace
            .get(&name)
            .ok_or_else(|| format!("undefined name {name}"))?;
        if !self.peek_punct('(') {
            return Ok(bound.clone());
        }
        let Value::RecordType { fields, .. } = bound else {
            return Err(format!("{name} is not callable"));
        };
        self.next();
        let args = self.sequence(')')?;
        if args.len() != fields.len() {
            return Err(format!(
                "{name} takes {} fields, {} given",
                fields.len(),
                args.len()
            ));
        }
        Ok(Value::Record {
            type_name: name,
            fields: fields.iter().cloned().zip(args).collect(),
        })
    }
}

/// A parsed data file: the namespace of assigned names.
#[derive(Clone, Debug, Default)]
pub struct DataFile {
    namespace: Namespace,
    version: Option<String>,
    skipped_lines: usize,
}

impl DataFile {
    pub fn parse<R: BufRead>(reader: R) -> Result<Self> {
        let mut file = Self::default();
        let mut last_rddata: Option<Target> = None;
        let undecodable = for_each_line(reader, "data file", |lineno, line| {
            file.feed(lineno, line, &mut last_rddata)
        })?;
        file.skipped_lines += undecodable;
        Ok(file)
    }

    pub fn parse_str(text: &str) -> Self {
        let mut file = Self::default();
        let mut last_rddata = None;
        for (idx, line) in text.lines().enumerate() {
            file.feed(idx + 1, line, &mut last_rddata);
        }
        file
    }

    pub fn load(path: &Path) -> Result<Self> {
        let handle = std::fs::File::open(path).map_err(|e| AnalysisError::from_open(e, path))?;
        let file = Self::parse(std::io::BufReader::new(handle))?;
        info!(
            path = %path.display(),
            names = file.namespace.len(),
            skipped = file.skipped_lines,
            version = file.version.as_deref().unwrap_or("unknown"),
            "loaded data file"
        );
        Ok(file)
    }

    fn feed(&mut self, lineno: usize, line: &str, last_rddata: &mut Option<Target>) {
        if let Err(reason) = self.apply_line(line, last_rddata) {
            let err = AnalysisError::parse(lineno, reason);
            warn!(%err, "skipping data file line");
            self.skipped_lines += 1;
        }
    }

    fn apply_line(
        &mut self,
        line: &str,
        last_rddata: &mut Option<Target>,
    ) -> std::result::Result<(), String> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Ok(());
        }
        let Some(directive) = trimmed.strip_prefix('#') else {
            self.execute(trimmed)?;
            return Ok(());
        };
        let (tag, body) = directive.split_once(char::is_whitespace).unwrap_or((directive, ""));
        match tag {
            "librda" => {
                let version = body.trim();
                let version = version.strip_prefix("version").unwrap_or(version).trim();
                self.version = Some(version.to_string());
            }
            "rddata" => {
                if let Some(target) = self.execute(body)? {
                    *last_rddata = Some(target);
                }
            }
            "cache" => {
                self.execute(body)?;
            }
            "preds" => {
                let mut parser = Parser::new(body, &self.namespace)?;
                let preds = parser.expr()?;
                parser.expect_end()?;
                let target = last_rddata
                    .as_ref()
                    .ok_or("predictions without a preceding #rddata line")?;
                self.attach_predictions(target, preds)?;
            }
            _ => debug!(tag, "ignoring directive"),
        }
        Ok(())
    }

    fn execute(&mut self, src: &str) -> std::result::Result<Option<Target>, String> {
        let parsed = Parser::new(src, &self.namespace)?.statement()?;
        let Some((target, value)) = parsed else {
            return Ok(None);
        };
        self.assign(&target, value)?;
        Ok(Some(target))
    }

    fn assign(&mut self, target: &Target, value: Value) -> std::result::Result<(), String> {
        let Some((last, path)) = target.keys.split_last() else {
            self.namespace.insert(target.name.clone(), value);
            return Ok(());
        };
        let container = self.resolve_mut(&target.name, path)?;
        container.set(last.clone(), value)
    }

    fn resolve_mut(&mut self, name: &str, path: &[Value]) -> std::result::Result<&mut Value, String> {
        let mut current = self
            .namespace
            .get_mut(name)
            .ok_or_else(|| format!("undefined name {name}"))?;
        for key in path {
            current = current
                .get_mut(key)
                .ok_or_else(|| format!("key {key:?} not found under {name}"))?;
        }
        Ok(current)
    }

    /// Legacy records are lists and get the predictions appended; current records are dicts
    /// and get them under `'predictions'`.
    fn attach_predictions(&mut self, target: &Target, preds: Value) -> std::result::Result<(), String> {
        let record = self.resolve_mut(&target.name, &target.keys)?;
        if matches!(record, Value::Dict(_)) {
            return record.set(Value::Str("predictions".into()), preds);
        }
        match record {
            Value::List(items) => {
                items.push(preds);
                Ok(())
            }
            other => Err(format!("cannot attach predictions to {}", other.kind())),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.namespace.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.namespace.keys().map(String::as_str)
    }

    /// Producer version from the `#librda` header.
    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    /// Resolves a stack (`simStacks`, `simSharedStack`, ...) into a profile.
    ///
    /// A stack keyed by thread id gives one histogram per thread; a single shared record is
    /// treated as thread 1.
    ///
    /// Bad buckets are dropped from their thread, and a thread record of the wrong shape is
    /// dropped whole; the remaining threads load normally.
    pub fn reuse_profile(&self, name: &str) -> Result<ReuseProfile> {
        let value = self
            .get(name)
            .ok_or_else(|| AnalysisError::not_found(format!("stack {name}")))?;
        let mut records = BTreeMap::new();
        match value {
            Value::List(_) => {
                records.insert(ThreadId(1), thread_record(value)?);
            }
            Value::Dict(_) if value.get_str("histogram").is_some() => {
                records.insert(ThreadId(1), thread_record(value)?);
            }
            Value::Dict(entries) => {
                for (key, record) in entries {
                    let Some(thread) = key.as_u64().and_then(|t| u32::try_from(t).ok()) else {
                        warn!(stack = name, ?key, "skipping record with a bad thread id");
                        continue;
                    };
                    match thread_record(record) {
                        Ok(record) => {
                            records.insert(ThreadId(thread), record);
                        }
                        Err(err) => warn!(stack = name, thread, %err, "skipping thread record"),
                    }
                }
            }
            other => {
                return Err(AnalysisError::schema(format!(
                    "{name} is a {}, expected a stack",
                    other.kind()
                )))
            }
        }
        debug!(stack = name, threads = records.len(), "resolved stack");
        Ok(ReuseProfile::from_records(name, records))
    }

    /// Per-PC records (`PCDist`, `PCDistRead`).
    pub fn pc_profile(&self, name: &str) -> Result<PcProfile> {
        let value = self
            .get(name)
            .ok_or_else(|| AnalysisError::not_found(format!("PC records {name}")))?;
        let Value::Dict(entries) = value else {
            return Err(AnalysisError::schema(format!("{name} is not a dict")));
        };
        let mut records = BTreeMap::new();
        for (pc, stats) in entries {
            let Some(pc) = pc.as_u64() else {
                warn!(records = name, ?pc, "skipping record with a bad PC");
                continue;
            };
            match pc_record(stats) {
                Ok(record) => {
                    records.insert(pc, record);
                }
                Err(err) => warn!(records = name, pc, %err, "skipping PC record"),
            }
        }
        Ok(PcProfile::new(records))
    }

    /// The recorded image ranges, or a quiet empty map when the run recorded none.
    pub fn library_map(&self) -> Result<LibraryMap> {
        let Some(value) = self.get("LibraryMap") else {
            return Ok(LibraryMap::empty());
        };
        let items = match value {
            Value::List(items) | Value::Tuple(items) => items,
            other => {
                return Err(AnalysisError::schema(format!(
                    "LibraryMap is a {}",
                    other.kind()
                )))
            }
        };
        let mut entries = Vec::with_capacity(items.len());
        for item in items {
            match image_range(item) {
                Ok(range) => entries.push(range),
                Err(err) => warn!(%err, "skipping library map entry"),
            }
        }
        Ok(LibraryMap::new(entries))
    }
}

/// True when the file starts like a reuse-distance data file.
pub fn is_rddata_file(path: &Path) -> Result<bool> {
    let handle = std::fs::File::open(path).map_err(|e| AnalysisError::from_open(e, path))?;
    let mut first = String::new();
    std::io::BufReader::new(handle).read_line(&mut first)?;
    Ok(first.starts_with("#librda") || first.starts_with("singleStacks"))
}

fn thread_record(value: &Value) -> Result<ThreadRecord> {
    match value {
        Value::List(items) => {
            let histogram = items
                .first()
                .ok_or_else(|| AnalysisError::schema("empty thread record"))?;
            let attributes = items.get(1).map(attributes).unwrap_or_default();
            let mut record = LegacyThreadRecord {
                histogram: ThreadHistogram::new(buckets(histogram)?, attributes),
                ..LegacyThreadRecord::default()
            };
            for extra in items.iter().skip(2) {
                match extra {
                    Value::Dict(_) => record.predictions = Some(predictions(extra)?),
                    Value::List(rows) => record.time_histogram = Some(time_histogram(rows)?),
                    other => debug!(kind = other.kind(), "ignoring extra thread record field"),
                }
            }
            Ok(ThreadRecord::Legacy(record))
        }
        Value::Dict(_) => {
            let mut record = CurrentThreadRecord {
                histogram: histogram_section(value)?,
                predictions: value.get_str("predictions").map(predictions).transpose()?,
                ..CurrentThreadRecord::default()
            };
            for kind in ReferenceKind::SECTIONS {
                if let Some(section) = kind.section_name().and_then(|n| value.get_str(n)) {
                    record.sections.insert(kind, histogram_section(section)?);
                }
            }
            Ok(ThreadRecord::Current(record))
        }
        other => Err(AnalysisError::schema(format!(
            "thread record is a {}",
            other.kind()
        ))),
    }
}

fn histogram_section(value: &Value) -> Result<ThreadHistogram> {
    let histogram = value
        .get_str("histogram")
        .ok_or_else(|| AnalysisError::schema("record has no histogram"))?;
    let attributes = value.get_str("attributes").map(attributes).unwrap_or_default();
    Ok(ThreadHistogram::new(buckets(histogram)?, attributes))
}

fn distance_key(key: &Value) -> Result<DistanceKey> {
    let raw = key
        .as_f64()
        .ok_or_else(|| AnalysisError::schema(format!("non-numeric distance {key:?}")))?;
    DistanceKey::from_raw(raw)
}

fn buckets(value: &Value) -> Result<BTreeMap<DistanceKey, u64>> {
    let Value::Dict(entries) = value else {
        return Err(AnalysisError::schema(format!("histogram is a {}", value.kind())));
    };
    let mut buckets = BTreeMap::new();
    for (key, count) in entries {
        let Some(count) = count.as_u64() else {
            warn!(?key, ?count, "skipping bucket with a bad count");
            continue;
        };
        match distance_key(key) {
            Ok(key) => *buckets.entry(key).or_insert(0) += count,
            Err(err) => warn!(%err, count, "skipping bucket with a bad distance"),
        }
    }
    Ok(buckets)
}

/// Numeric attributes; anything else is ignored.
fn attributes(value: &Value) -> ThreadAttributes {
    let Value::Dict(entries) = value else {
        return ThreadAttributes::new();
    };
    entries
        .iter()
        .filter_map(|(k, v)| Some((k.as_str()?.to_string(), v.as_f64()?)))
        .collect()
}

fn u64_list(value: &Value) -> Result<Vec<u64>> {
    let (Value::List(items) | Value::Tuple(items)) = value else {
        return Err(AnalysisError::schema(format!("expected a list, found {}", value.kind())));
    };
    items
        .iter()
        .map(|v| {
            v.as_u64()
                .ok_or_else(|| AnalysisError::schema(format!("expected a count, found {v:?}")))
        })
        .collect()
}

fn predictions(value: &Value) -> Result<IntervalPredictions> {
    let Value::Dict(entries) = value else {
        return Err(AnalysisError::schema("predictions are not a dict"));
    };
    let mut preds = IntervalPredictions::default();
    for (key, series) in entries {
        match key {
            Value::Str(s) if s == "accesses" => preds.accesses = u64_list(series)?,
            _ => {
                let size = key
                    .as_u64()
                    .ok_or_else(|| AnalysisError::schema(format!("bad prediction size {key:?}")))?;
                preds.hits.insert(size, u64_list(series)?);
            }
        }
    }
    Ok(preds)
}

fn time_histogram(rows: &[Value]) -> Result<Vec<Vec<u64>>> {
    rows.iter().map(u64_list).collect()
}

fn pc_record(value: &Value) -> Result<PcRecord> {
    let (Value::Tuple(fields) | Value::List(fields)) = value else {
        return Err(AnalysisError::schema(format!("PC record is a {}", value.kind())));
    };
    let [total, count, histogram] = fields.as_slice() else {
        return Err(AnalysisError::schema("PC record needs (total, count, histogram)"));
    };
    let total_distance = total
        .as_f64()
        .ok_or_else(|| AnalysisError::schema("bad total distance"))?;
    let access_count = count
        .as_u64()
        .ok_or_else(|| AnalysisError::schema("bad access count"))?;
    let Value::Dict(entries) = histogram else {
        return Err(AnalysisError::schema("PC histogram is not a dict"));
    };
    let mut buckets = BTreeMap::new();
    for (key, bucket) in entries {
        match pc_bucket(key, bucket) {
            Ok((key, bucket)) => {
                buckets.insert(key, bucket);
            }
            Err(err) => warn!(%err, "skipping PC bucket"),
        }
    }
    Ok(PcRecord::new(total_distance, access_count, buckets))
}

/// The 0 bucket and the sentinels carry no meaningful mean.
fn pc_bucket(key: &Value, bucket: &Value) -> Result<(DistanceKey, PcBucket)> {
    let key = distance_key(key)?;
    let bucket = match bucket {
        Value::Tuple(pair) | Value::List(pair) => {
            let [n, mean] = pair.as_slice() else {
                return Err(AnalysisError::schema("PC bucket needs (count, mean)"));
            };
            let n = n
                .as_u64()
                .ok_or_else(|| AnalysisError::schema(format!("bad PC bucket count {n:?}")))?;
            match (key, mean.as_f64()) {
                (DistanceKey::Finite(d), Some(mean)) if d.value() > 0.0 => {
                    PcBucket::with_mean(n, mean)
                }
                _ => PcBucket::count_only(n),
            }
        }
        other => PcBucket::count_only(
            other
                .as_u64()
                .ok_or_else(|| AnalysisError::schema(format!("bad PC bucket count {other:?}")))?,
        ),
    };
    Ok((key, bucket))
}

fn image_range(value: &Value) -> Result<ImageRange> {
    let field = |name: &str, idx: i128| value.field(name).or_else(|| value.get(&Value::Int(idx)));
    let name = field("name", 0)
        .and_then(Value::as_str)
        .ok_or_else(|| AnalysisError::schema("library entry without a name"))?;
    let base = field("base", 1)
        .and_then(Value::as_u64)
        .ok_or_else(|| AnalysisError::schema("library entry without a base"))?;
    let top = field("top", 2)
        .and_then(Value::as_u64)
        .ok_or_else(|| AnalysisError::schema("library entry without a top"))?;
    Ok(ImageRange::new(name, base, top))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Distance;

    const CURRENT: &str = "\
#librda version 3f2e1d
singleStacks = {}
simStacks = {}
#rddata simStacks[0] = {'histogram':{1.000000:10, 4.000000:5, 9223372036854775808.000000:3}, 'attributes':{'sampleCount':18, 'blockAccessCount':18, 'totalPredictionAccesses':18, }, 'read_histo':{'histogram':{1.000000:7, }, 'attributes':{}}, }
#preds { 512: [4, 6, ], 'accesses': [9, 9, ]}
#rddata simStacks[1] = {'histogram':{}, 'attributes':{'sampleCount':0}, }
#preds { 512: [], 'accesses': []}
PCDist = {0x400514:(27,18,{0:(2,0.0),1.000000:(10,1.000000),4611686018427387904.000000:0,9223372036854775808.000000:3}), }
import collections
LME = collections.namedtuple('LME', 'name base top')
LibraryMap = [LME('bench',0x400000,0x4fffff),LME('libc.so',0x7f0000,0x7fffff),]
";

    #[test]
    fn tokenizes_literals() {
        let tokens = tokenize("x = [0x1f, -2, 1.5e3, 'a\\'b', 7L]").unwrap();
        assert_eq!(tokens[0], Token::Ident("x".into()));
        assert!(tokens.contains(&Token::Int(31)));
        assert!(tokens.contains(&Token::Float(1500.0)));
        assert!(tokens.contains(&Token::Str("a'b".into())));
        assert!(tokens.contains(&Token::Int(7)));
    }

    #[test]
    fn parses_nested_values() {
        let ns = Namespace::new();
        let v = Parser::new("{'a': (1, ), 2.0: [None, True], 'c': (3)}", &ns)
            .unwrap()
            .expr()
            .unwrap();
        assert_eq!(v.get_str("a"), Some(&Value::Tuple(vec![Value::Int(1)])));
        assert_eq!(
            v.get(&Value::Int(2)),
            Some(&Value::List(vec![Value::None, Value::Bool(true)]))
        );
        assert_eq!(v.get_str("c"), Some(&Value::Int(3)));
    }

    #[test]
    fn current_layout_with_sections_and_predictions() {
        let file = DataFile::parse_str(CURRENT);
        assert_eq!(file.skipped_lines(), 0);
        assert_eq!(file.version(), Some("3f2e1d"));
        let profile = file.reuse_profile("simStacks").unwrap();
        let store = profile.all();
        assert_eq!(store.default_selection().threads(), &[ThreadId(0)]);
        assert_eq!(store.quantile(0.6).unwrap(), DistanceKey::lines(4));
        let read = profile.store(ReferenceKind::Read).unwrap();
        assert_eq!(read.thread(ThreadId(0)).unwrap().total(), 7);
        let preds = &profile.predictions()[&ThreadId(0)];
        assert_eq!(preds.hits[&512], vec![4, 6]);
        assert_eq!(preds.accesses, vec![9, 9]);
    }

    #[test]
    fn legacy_layout_gets_predictions_appended() {
        let text = "\
simStacks = {}
#rddata simStacks[2] = [{1:3, 2:1}, {'sampleCount':4}, [[1, 2], [0, 1]]]
#preds {64: [1, 2, ], 'accesses': [2, 2, ]}
";
        let file = DataFile::parse_str(text);
        assert_eq!(file.skipped_lines(), 0);
        let profile = file.reuse_profile("simStacks").unwrap();
        assert_eq!(profile.time_histogram().unwrap(), &[vec![1, 2], vec![0, 1]]);
        assert_eq!(profile.predictions()[&ThreadId(2)].hits[&64], vec![1, 2]);
        assert_eq!(profile.all().access_count(&profile.all().default_selection()), 4);
    }

    #[test]
    fn shared_stack_is_thread_one() {
        let text = "#rddata simSharedStack = {'histogram':{2:5}, 'attributes':{'sampleCount':5}}\n";
        let profile = DataFile::parse_str(text).reuse_profile("simSharedStack").unwrap();
        assert!(profile.all().thread(ThreadId(1)).is_some());
    }

    #[test]
    fn pc_records_and_library_map() {
        let file = DataFile::parse_str(CURRENT);
        let pcs = file.pc_profile("PCDist").unwrap();
        let record = pcs.get(0x400514).unwrap();
        assert_eq!(record.access_count, 18);
        assert_eq!(record.histogram[&DistanceKey::lines(0)].mean_distance, None);
        assert_eq!(record.histogram[&DistanceKey::lines(1)].mean_distance, Some(1.0));
        assert_eq!(record.misses_at(Distance::lines(2), true), 3);

        let map = file.library_map().unwrap();
        assert_eq!(map.entries().len(), 2);
        assert_eq!(map.normalize(0x400514).offset, 0x514);
    }

    #[test]
    fn absent_library_map_is_empty() {
        let file = DataFile::parse_str("x = 1\n");
        assert!(file.library_map().unwrap().entries().is_empty());
        assert!(matches!(
            file.reuse_profile("simStacks"),
            Err(AnalysisError::NotFound { .. })
        ));
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let text = "\
a = {1: 2}
b = __import__('os').system('rm -rf /')
c = [1, 2
d = a[1]
a[3] = 'x'
#preds {1: [1]}
";
        let file = DataFile::parse_str(text);
        assert_eq!(file.skipped_lines(), 3);
        assert_eq!(file.get("d"), Some(&Value::Int(2)));
        assert_eq!(file.get("a").unwrap().get(&Value::Int(3)), Some(&Value::Str("x".into())));
        assert!(file.get("b").is_none());
    }

    #[test]
    fn undecodable_line_is_skipped() {
        let input: &[u8] = b"#librda version x\nsimStacks = {}\n# comment \xff\xfe bad\n#rddata simStacks[0] = {'histogram':{1:4, }, 'attributes':{}, }\n";
        let file = DataFile::parse(input).unwrap();
        assert_eq!(file.skipped_lines(), 1);
        assert_eq!(file.version(), Some("x"));
        let profile = file.reuse_profile("simStacks").unwrap();
        assert_eq!(profile.all().thread(ThreadId(0)).unwrap().total(), 4);
    }

    #[test]
    fn bad_thread_records_do_not_spoil_the_stack() {
        let text = "\
simStacks = {}
#rddata simStacks[0] = {'histogram':{1:10, 2:5}, 'attributes':{}, }
#rddata simStacks[1] = {'histogram':{1:-3, -4:2, 3:1}, 'attributes':{}, }
#rddata simStacks[2] = {'histogram':'oops', 'attributes':{}, }
";
        let file = DataFile::parse_str(text);
        assert_eq!(file.skipped_lines(), 0);
        let profile = file.reuse_profile("simStacks").unwrap();
        let store = profile.all();
        let good = store.thread(ThreadId(0)).unwrap();
        let expected: BTreeMap<DistanceKey, u64> =
            [(DistanceKey::lines(1), 10), (DistanceKey::lines(2), 5)].into_iter().collect();
        assert_eq!(good.buckets(), &expected);
        let partial = store.thread(ThreadId(1)).unwrap();
        assert_eq!(partial.total(), 1);
        assert_eq!(partial.count(&DistanceKey::lines(3)), 1);
        assert!(store.thread(ThreadId(2)).is_none());
    }

    #[test]
    fn bad_pc_records_do_not_spoil_the_profile() {
        let text = "PCDist = {0x10:(5,3,{1:(2,1.0), -1:(1,0.0), 2:'x'}), 0x20:'bad', 0x30:(3,1,{2:1}), 'pc':(1,1,{1:1})}\n";
        let pcs = DataFile::parse_str(text).pc_profile("PCDist").unwrap();
        assert_eq!(pcs.len(), 2);
        let first = pcs.get(0x10).unwrap();
        assert_eq!(first.histogram.len(), 1);
        assert_eq!(first.histogram[&DistanceKey::lines(1)].count, 2);
        assert_eq!(pcs.get(0x30).unwrap().histogram_total(), 1);
        assert!(pcs.get(0x20).is_none());
    }

    #[test]
    fn detects_data_files() {
        let dir = tempfile::tempdir().unwrap();
        let yes = dir.path().join("bench.rd");
        std::fs::write(&yes, "#librda version x\n").unwrap();
        let no = dir.path().join("bench-samples");
        std::fs::write(&no, "12 1.0% 1.0% 0x10\n").unwrap();
        assert!(is_rddata_file(&yes).unwrap());
        assert!(!is_rddata_file(&no).unwrap());
        assert!(matches!(
            is_rddata_file(&dir.path().join("missing")),
            Err(AnalysisError::MissingFile { .. })
        ));
    }
}
