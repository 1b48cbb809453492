//! Indentation-sensitive configuration parser.
//!
//! Grounded on the original loader's `Config.h`/`Config.cpp`: a single
//! forward pass over the source text drives a small state machine (key,
//! value, loadable-entry title, comment), emplacing entries into a flat
//! arena as it goes and linking siblings of the same scope together by
//! index. Indentation establishes nesting: the first indented line in the
//! file fixes how many whitespace characters make up one nesting level, and
//! every subsequent line's depth is derived from dividing its leading
//! whitespace by that unit.
//!
//! The arena is a plain `Vec` rather than the original's manually doubled
//! array, and sibling/child links are absolute indices rather than
//! relative-offset deltas — both are storage-strategy simplifications that
//! change nothing about ordering or lookup semantics.

use alloc::vec::Vec;

use crate::loader_panic;

/// Longest supported nesting depth. Matches the original parser's fixed
/// `depth_to_offset` table size.
const MAX_DEPTH: usize = 255;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MustBeUnique {
    Yes,
    No,
}

/// A parsed configuration value. Borrows string data directly out of the
/// source text that was parsed — a [`Config`] cannot outlive the source
/// buffer it was built from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value<'a> {
    None,
    Bool(bool),
    Unsigned(u64),
    Signed(i64),
    String(&'a str),
    /// Holds the scope-start index: the arena index of the first entry
    /// belonging to this object.
    Object(usize),
}

impl<'a> Value<'a> {
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Value::None)
    }

    #[must_use]
    pub const fn as_bool(&self) -> Option<bool> {
        if let Value::Bool(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_unsigned(&self) -> Option<u64> {
        if let Value::Unsigned(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_signed(&self) -> Option<i64> {
        if let Value::Signed(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn as_string(&self) -> Option<&'a str> {
        if let Value::String(v) = self {
            Some(*v)
        } else {
            None
        }
    }

    #[must_use]
    pub const fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    const fn type_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Bool(_) => "boolean",
            Value::Unsigned(_) => "unsigned integer",
            Value::Signed(_) => "signed integer",
            Value::String(_) => "string",
            Value::Object(_) => "object",
        }
    }
}

/// Panics with a message naming `key`, its expected type and what was
/// actually found. Used by callers that know a config key's schema ahead of
/// time (e.g. the boot driver reading `default` or `timeout`).
pub fn extract_unsigned(key: &str, value: Value<'_>) -> u64 {
    value
        .as_unsigned()
        .unwrap_or_else(|| loader_panic!("config key \"{}\": expected unsigned integer, got {}", key, value.type_name()))
}

pub fn extract_signed(key: &str, value: Value<'_>) -> i64 {
    value
        .as_signed()
        .unwrap_or_else(|| loader_panic!("config key \"{}\": expected signed integer, got {}", key, value.type_name()))
}

pub fn extract_string<'a>(key: &str, value: Value<'a>) -> &'a str {
    value
        .as_string()
        .unwrap_or_else(|| loader_panic!("config key \"{}\": expected string, got {}", key, value.type_name()))
}

pub fn extract_bool(key: &str, value: Value<'_>) -> bool {
    value
        .as_bool()
        .unwrap_or_else(|| loader_panic!("config key \"{}\": expected boolean, got {}", key, value.type_name()))
}

#[derive(Debug, Clone, Copy)]
enum EntryKind<'a> {
    Value(Value<'a>),
    LoadableEntry { next_loadable: Option<usize> },
}

#[derive(Debug, Clone, Copy)]
struct Entry<'a> {
    key: &'a str,
    kind: EntryKind<'a>,
    next_in_scope: Option<usize>,
}

/// Where in the source text a parse failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseError {
    pub message: &'static str,
    pub line: usize,
    pub column: usize,
    pub byte_offset: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FindResult {
    first: usize,
    last: usize,
    count: usize,
}

/// A parsed configuration file.
pub struct Config<'a> {
    entries: Vec<Entry<'a>>,
    first_loadable_entry: Option<usize>,
    last_loadable_entry: Option<usize>,
}

impl<'a> Config<'a> {
    /// Parses `source` into a flat entry arena. Indentation fixes nesting;
    /// the first indentation encountered sets how many whitespace
    /// characters make up one level, and mixing tabs and spaces within that
    /// unit is rejected.
    pub fn parse(source: &'a str) -> Result<Self, ParseError> {
        parser::run(source)
    }

    /// Looks up `key` directly in the top-level (global) scope.
    #[must_use]
    pub fn get(&self, key: &str, unique: MustBeUnique) -> Option<Value<'a>> {
        self.get_at(0, key, unique)
    }

    #[must_use]
    pub fn get_last(&self, key: &str) -> Option<Value<'a>> {
        self.get_last_at(0, key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.contains_at(0, key)
    }

    #[must_use]
    pub fn get_all(&self, key: &str) -> DuplicateValues<'_, 'a> {
        self.get_all_at(0, key)
    }

    #[must_use]
    pub fn loadable_entries(&self) -> LoadableEntries<'_, 'a> {
        LoadableEntries {
            config: self,
            next: self.first_loadable_entry,
        }
    }

    #[must_use]
    pub fn get_loadable_entry(&self, name: &str) -> Option<LoadableEntry<'_, 'a>> {
        self.loadable_entries().find(|entry| entry.name() == name)
    }

    /// Iterates the key/value pairs nested under `value`, which must be
    /// [`Value::Object`].
    #[must_use]
    pub fn object_iter(&self, value: Value<'a>) -> KeyValues<'_, 'a> {
        let Value::Object(scope) = value else {
            loader_panic!("config: object_iter() called on a non-object value");
        };
        KeyValues {
            config: self,
            next: Some(scope),
        }
    }

    #[must_use]
    pub fn object_get(&self, value: Value<'a>, key: &str, unique: MustBeUnique) -> Option<Value<'a>> {
        let Value::Object(scope) = value else {
            loader_panic!("config: object_get() called on a non-object value");
        };
        self.get_at(scope, key, unique)
    }

    #[must_use]
    pub fn object_contains(&self, value: Value<'a>, key: &str) -> bool {
        let Value::Object(scope) = value else {
            loader_panic!("config: object_contains() called on a non-object value");
        };
        self.contains_at(scope, key)
    }

    fn get_at(&self, scope: usize, key: &str, unique: MustBeUnique) -> Option<Value<'a>> {
        let result = self.find(scope, key, 2);
        if result.count == 0 {
            return None;
        }
        if result.count > 1 && unique == MustBeUnique::Yes {
            loader_panic!("config key \"{}\" must be unique", key);
        }
        self.value_at(result.first)
    }

    fn get_last_at(&self, scope: usize, key: &str) -> Option<Value<'a>> {
        let result = self.find(scope, key, 0);
        if result.count == 0 {
            return None;
        }
        self.value_at(result.last)
    }

    fn contains_at(&self, scope: usize, key: &str) -> bool {
        self.find(scope, key, 1).count > 0
    }

    fn get_all_at(&self, scope: usize, key: &str) -> DuplicateValues<'_, 'a> {
        let result = self.find(scope, key, 0);
        DuplicateValues {
            config: self,
            key: alloc::string::String::from(key),
            next: if result.count > 0 { Some(result.first) } else { None },
        }
    }

    /// Walks the sibling chain starting at `scope`, counting occurrences of
    /// `key` up to `constraint_max` (0 meaning unbounded).
    fn find(&self, scope: usize, key: &str, constraint_max: usize) -> FindResult {
        let mut result = FindResult {
            first: 0,
            last: 0,
            count: 0,
        };

        if scope >= self.entries.len() {
            return result;
        }

        let mut offset = scope;
        loop {
            let entry = &self.entries[offset];

            if matches!(entry.kind, EntryKind::Value(_)) && entry.key == key {
                if result.count == 0 {
                    result.first = offset;
                }
                result.last = offset;
                result.count += 1;

                if constraint_max != 0 && result.count == constraint_max {
                    break;
                }
            }

            match entry.next_in_scope {
                Some(next) => offset = next,
                None => break,
            }
        }

        result
    }

    fn value_at(&self, offset: usize) -> Option<Value<'a>> {
        match self.entries.get(offset)?.kind {
            EntryKind::Value(v) => Some(v),
            EntryKind::LoadableEntry { .. } => None,
        }
    }
}

/// Iterator over every `[name]` loadable entry in a [`Config`], in file
/// order.
pub struct LoadableEntries<'cfg, 'src> {
    config: &'cfg Config<'src>,
    next: Option<usize>,
}

impl<'cfg, 'src> Iterator for LoadableEntries<'cfg, 'src> {
    type Item = LoadableEntry<'cfg, 'src>;

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next?;
        let entry = &self.config.entries[offset];
        let EntryKind::LoadableEntry { next_loadable } = entry.kind else {
            unreachable!("loadable entry chain points at a non-loadable-entry slot");
        };

        self.next = next_loadable;
        Some(LoadableEntry {
            config: self.config,
            name: entry.key,
            scope: offset + 1,
        })
    }
}

/// A single `[name]` section: a named scope of key/value pairs.
#[derive(Clone, Copy)]
pub struct LoadableEntry<'cfg, 'src> {
    config: &'cfg Config<'src>,
    name: &'src str,
    scope: usize,
}

impl<'cfg, 'src> LoadableEntry<'cfg, 'src> {
    #[must_use]
    pub const fn name(&self) -> &'src str {
        self.name
    }

    #[must_use]
    pub fn get(&self, key: &str, unique: MustBeUnique) -> Option<Value<'src>> {
        self.config.get_at(self.scope, key, unique)
    }

    #[must_use]
    pub fn get_last(&self, key: &str) -> Option<Value<'src>> {
        self.config.get_last_at(self.scope, key)
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.config.contains_at(self.scope, key)
    }

    #[must_use]
    pub fn get_all(&self, key: &str) -> DuplicateValues<'cfg, 'src> {
        self.config.get_all_at(self.scope, key)
    }

    #[must_use]
    pub fn iter(&self) -> KeyValues<'cfg, 'src> {
        KeyValues {
            config: self.config,
            next: Some(self.scope),
        }
    }
}

/// Iterator over every key/value pair in a scope, in file order — including
/// repeated keys.
pub struct KeyValues<'cfg, 'src> {
    config: &'cfg Config<'src>,
    next: Option<usize>,
}

impl<'cfg, 'src> Iterator for KeyValues<'cfg, 'src> {
    type Item = (&'src str, Value<'src>);

    fn next(&mut self) -> Option<Self::Item> {
        let offset = self.next?;
        let entry = &self.config.entries[offset];
        self.next = entry.next_in_scope;

        match entry.kind {
            EntryKind::Value(v) => Some((entry.key, v)),
            EntryKind::LoadableEntry { .. } => self.next(),
        }
    }
}

/// Iterator over every occurrence of one key within a scope.
pub struct DuplicateValues<'cfg, 'src> {
    config: &'cfg Config<'src>,
    key: alloc::string::String,
    next: Option<usize>,
}

impl<'cfg, 'src> Iterator for DuplicateValues<'cfg, 'src> {
    type Item = Value<'src>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let offset = self.next?;
            let entry = &self.config.entries[offset];
            self.next = entry.next_in_scope;

            if let EntryKind::Value(v) = entry.kind {
                if entry.key == self.key.as_str() {
                    return Some(v);
                }
            }
        }
    }
}

mod parser {
    use super::{Config, Entry, EntryKind, ParseError, Value, MAX_DEPTH};
    use alloc::vec::Vec;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum State {
        Normal,
        Key,
        Value,
        LoadableEntryTitle,
        Comment,
    }

    struct ParseState {
        file_line: usize,
        line_offset: usize,
        global_offset: usize,

        state: State,

        whitespace_character: Option<u8>,
        current_whitespace_depth: usize,
        characters_per_level: usize,

        expecting_end_of_value: bool,
        consumed_at_least_one: bool,

        base_depth_is_nonzero: Option<bool>,
        open_quote_character: Option<u8>,

        current_value_start: usize,
        current_value_len: usize,
        current_key_start: usize,
        current_key_len: usize,

        within_loadable_entry: bool,
        expecting_depth_plus_one: bool,
        consumed_at_least_one_kv: bool,

        current_depth: usize,
        depth_to_offset: [Option<usize>; MAX_DEPTH],
    }

    impl ParseState {
        fn new() -> Self {
            Self {
                file_line: 1,
                line_offset: 1,
                global_offset: 0,
                state: State::Normal,
                whitespace_character: None,
                current_whitespace_depth: 0,
                characters_per_level: 0,
                expecting_end_of_value: false,
                consumed_at_least_one: false,
                base_depth_is_nonzero: None,
                open_quote_character: None,
                current_value_start: 0,
                current_value_len: 0,
                current_key_start: 0,
                current_key_len: 0,
                within_loadable_entry: false,
                expecting_depth_plus_one: false,
                consumed_at_least_one_kv: false,
                current_depth: 0,
                depth_to_offset: [None; MAX_DEPTH],
            }
        }
    }

    macro_rules! parse_error {
        ($s:expr, $msg:expr) => {
            return Err(ParseError {
                message: $msg,
                line: $s.file_line,
                column: $s.line_offset,
                byte_offset: $s.global_offset,
            })
        };
    }

    fn key_str<'a>(source: &'a str, s: &ParseState) -> &'a str {
        &source[s.current_key_start..s.current_key_start + s.current_key_len]
    }

    fn value_str<'a>(source: &'a str, s: &ParseState) -> &'a str {
        &source[s.current_value_start..s.current_value_start + s.current_value_len]
    }

    fn set_state(s: &mut ParseState, new_state: State) {
        match new_state {
            State::Normal => {
                if s.state == State::LoadableEntryTitle {
                    s.within_loadable_entry = true;
                    let clear_through = s.current_depth + usize::from(!s.base_depth_is_nonzero.unwrap_or(false));
                    for depth in 1..=clear_through {
                        if depth < MAX_DEPTH {
                            s.depth_to_offset[depth] = None;
                        }
                    }
                    s.current_depth = 0;
                }
                s.expecting_end_of_value = false;
                s.consumed_at_least_one = false;
                s.open_quote_character = None;
            }
            State::Key => {
                s.consumed_at_least_one = false;
                s.expecting_depth_plus_one = true;
            }
            State::Value => {
                s.expecting_depth_plus_one = false;
                s.consumed_at_least_one = false;
                s.expecting_end_of_value = false;
                s.open_quote_character = None;
            }
            State::LoadableEntryTitle => {
                s.consumed_at_least_one = false;
                s.consumed_at_least_one_kv = false;
            }
            State::Comment => {}
        }
        s.state = new_state;
    }

    fn deduce_value<'a>(source: &'a str, s: &ParseState) -> Value<'a> {
        let text = value_str(source, s);

        if s.open_quote_character.is_some() {
            return Value::String(text);
        }
        match text {
            "null" => return Value::None,
            "true" => return Value::Bool(true),
            "false" => return Value::Bool(false),
            _ => {}
        }

        if let Some(value) = try_parse_as_number(text) {
            return value;
        }

        Value::String(text)
    }

    fn try_parse_as_number(text: &str) -> Option<Value<'static>> {
        let mut rest = text;
        let mut negative = false;

        if let Some(stripped) = rest.strip_prefix('-') {
            rest = stripped;
            negative = true;
        } else if let Some(stripped) = rest.strip_prefix('+') {
            rest = stripped;
        }

        let magnitude = if let Some(hex) = rest.strip_prefix("0x") {
            u64::from_str_radix(hex, 16).ok()?
        } else if rest.starts_with('0') {
            u64::from_str_radix(&rest[1..], 8).ok()?
        } else {
            rest.parse::<u64>().ok()?
        };

        if negative {
            let signed = i64::try_from(magnitude).ok()?.checked_neg()?;
            Some(Value::Signed(signed))
        } else {
            Some(Value::Unsigned(magnitude))
        }
    }

    /// Appends `entry`, links it as the previous sibling's successor at the
    /// current scope depth, and records it as the new head of that depth.
    fn finalize_key_value<'a>(
        source: &'a str,
        s: &mut ParseState,
        entries: &mut Vec<Entry<'a>>,
        is_object: bool,
    ) -> Result<(), ParseError> {
        let value = if is_object {
            Value::Object(entries.len() + 1)
        } else {
            deduce_value(source, s)
        };

        let key = key_str(source, s);
        let offset = entries.len();
        entries.push(Entry {
            key,
            kind: EntryKind::Value(value),
            next_in_scope: None,
        });

        let mut depth = s.current_depth + usize::from(s.within_loadable_entry);
        depth = depth.saturating_sub(usize::from(s.base_depth_is_nonzero.unwrap_or(false)));

        if depth >= MAX_DEPTH {
            parse_error!(s, "nesting too deep");
        }

        if let Some(previous) = s.depth_to_offset[depth] {
            entries[previous].next_in_scope = Some(offset);
        }
        s.depth_to_offset[depth] = Some(offset);
        s.consumed_at_least_one_kv = true;

        Ok(())
    }

    fn do_depth_transition(s: &mut ParseState) -> bool {
        if s.characters_per_level == 0 {
            return true;
        }

        if s.current_whitespace_depth % s.characters_per_level != 0 {
            return false;
        }

        let base_is_nonzero = s.base_depth_is_nonzero.unwrap_or(false) && s.within_loadable_entry;
        let next_depth = s.current_whitespace_depth / s.characters_per_level;

        let must_be_zero = !(s.expecting_depth_plus_one || s.current_depth != 0 || base_is_nonzero);
        if must_be_zero && next_depth != 0 {
            return false;
        }

        if next_depth > s.current_depth && (next_depth - s.current_depth) > 1 {
            return false;
        }

        if s.expecting_depth_plus_one && next_depth != s.current_depth + 1 {
            return false;
        }

        while s.current_depth > next_depth {
            let clear_at = s.current_depth + usize::from(!base_is_nonzero);
            if clear_at < MAX_DEPTH {
                s.depth_to_offset[clear_at] = None;
            }
            s.current_depth -= 1;
        }

        s.current_depth = next_depth;
        true
    }

    pub(super) fn run(source: &str) -> Result<Config<'_>, ParseError> {
        let mut s = ParseState::new();
        let mut entries: Vec<Entry<'_>> = Vec::new();
        let mut first_loadable_entry: Option<usize> = None;
        let mut last_loadable_entry: Option<usize> = None;

        let bytes = source.as_bytes();

        for (i, &c) in bytes.iter().enumerate() {
            s.line_offset += 1;
            s.global_offset += 1;

            if s.state == State::Comment && c != b'\n' {
                continue;
            }

            match c {
                b' ' | b'\t' => {
                    if s.state == State::Normal {
                        if let Some(existing) = s.whitespace_character {
                            if existing != c {
                                parse_error!(s, "mixed tabs and spaces are ambiguous");
                            }
                        }
                        s.whitespace_character = Some(c);
                        s.current_whitespace_depth += 1;
                        continue;
                    }

                    if s.state == State::Key {
                        s.expecting_end_of_value = s.consumed_at_least_one;
                        continue;
                    }

                    if s.state == State::Value {
                        if s.open_quote_character.is_none() {
                            s.expecting_end_of_value = s.consumed_at_least_one;
                            continue;
                        }
                        s.current_value_len += 1;
                        continue;
                    }

                    if s.expecting_end_of_value {
                        continue;
                    }

                    parse_error!(s, "invalid character");
                }

                b'\r' => {
                    if s.state == State::Normal || s.state == State::Value {
                        continue;
                    }
                    parse_error!(s, "invalid character");
                }

                b'\n' => {
                    s.file_line += 1;
                    s.line_offset = 0;

                    if s.characters_per_level == 0 {
                        s.whitespace_character = None;
                    }
                    s.current_whitespace_depth = 0;
                    s.expecting_end_of_value = false;

                    if s.state == State::Normal {
                        continue;
                    }

                    if s.state == State::Value {
                        finalize_key_value(source, &mut s, &mut entries, false)?;
                        set_state(&mut s, State::Normal);
                        continue;
                    }

                    if s.state == State::Comment {
                        set_state(&mut s, State::Normal);
                        continue;
                    }

                    parse_error!(s, "invalid character");
                }

                b'=' => {
                    if s.state == State::Normal || (s.state == State::Value && s.open_quote_character.is_none()) {
                        parse_error!(s, "invalid character");
                    }
                    if s.state == State::Key {
                        set_state(&mut s, State::Value);
                        continue;
                    }
                    s.current_value_len += 1;
                    continue;
                }

                b':' => {
                    if s.state == State::Normal {
                        parse_error!(s, "invalid character");
                    }
                    if s.state == State::Key {
                        finalize_key_value(source, &mut s, &mut entries, true)?;
                        set_state(&mut s, State::Normal);
                        s.expecting_end_of_value = true;
                        continue;
                    }
                    if s.state == State::Value && s.open_quote_character.is_none() {
                        parse_error!(s, "invalid character");
                    }
                    s.current_value_len += 1;
                    continue;
                }

                b'"' | b'\'' => {
                    if s.state != State::Value || (s.open_quote_character.is_none() && s.consumed_at_least_one) {
                        parse_error!(s, "invalid character");
                    }

                    if let Some(open) = s.open_quote_character {
                        if open != c {
                            if s.consumed_at_least_one {
                                s.current_value_len += 1;
                            } else {
                                s.current_value_start = i;
                                s.current_value_len = 1;
                            }
                            s.consumed_at_least_one = true;
                            continue;
                        }

                        finalize_key_value(source, &mut s, &mut entries, false)?;
                        set_state(&mut s, State::Normal);
                        s.expecting_end_of_value = true;
                        continue;
                    }

                    s.open_quote_character = Some(c);
                    continue;
                }

                b'[' => {
                    if s.current_whitespace_depth != 0 {
                        parse_error!(s, "loadable entry title must start on a new line");
                    }

                    if s.state == State::Normal {
                        if s.expecting_depth_plus_one {
                            parse_error!(s, "empty objects are not allowed");
                        }
                        if s.within_loadable_entry && !s.consumed_at_least_one_kv {
                            parse_error!(s, "empty loadable entries are not allowed");
                        }
                        set_state(&mut s, State::LoadableEntryTitle);
                        continue;
                    }

                    if s.state == State::Value && s.open_quote_character.is_some() {
                        s.current_value_len += 1;
                        continue;
                    }

                    parse_error!(s, "invalid character");
                }

                b']' => {
                    if s.state == State::LoadableEntryTitle {
                        let title = value_str(source, &s);

                        let offset = entries.len();
                        entries.push(Entry {
                            key: title,
                            kind: EntryKind::LoadableEntry { next_loadable: None },
                            next_in_scope: None,
                        });

                        if first_loadable_entry.is_none() {
                            first_loadable_entry = Some(offset);
                        }
                        if let Some(prev) = last_loadable_entry {
                            if let EntryKind::LoadableEntry { next_loadable } = &mut entries[prev].kind {
                                *next_loadable = Some(offset);
                            }
                        }

                        if let Some(previous) = s.depth_to_offset[0] {
                            entries[previous].next_in_scope = Some(offset);
                        }
                        s.depth_to_offset[0] = Some(offset);

                        last_loadable_entry = Some(offset);
                        set_state(&mut s, State::Normal);
                        s.expecting_end_of_value = true;
                        continue;
                    }

                    if s.state == State::Value && s.open_quote_character.is_some() {
                        s.current_value_len += 1;
                        continue;
                    }

                    parse_error!(s, "invalid character");
                }

                b'#' => {
                    if s.state == State::Key || s.state == State::LoadableEntryTitle {
                        parse_error!(s, "invalid character");
                    }
                    if s.state == State::Value && s.open_quote_character.is_some() {
                        s.current_value_len += 1;
                        continue;
                    }
                    s.expecting_end_of_value = false;
                    set_state(&mut s, State::Comment);
                    continue;
                }

                _ => {
                    if c <= 32 || c >= 127 {
                        parse_error!(s, "invalid character");
                    }
                    if s.expecting_end_of_value {
                        parse_error!(s, "unexpected character");
                    }

                    if s.state == State::Normal {
                        if s.current_whitespace_depth != 0 && s.characters_per_level == 0 {
                            s.characters_per_level = s.current_whitespace_depth;
                        }
                        if s.base_depth_is_nonzero.is_none() && s.within_loadable_entry {
                            s.base_depth_is_nonzero = Some(s.current_whitespace_depth != 0);
                        }
                        if !do_depth_transition(&mut s) {
                            parse_error!(s, "invalid number of whitespace");
                        }

                        set_state(&mut s, State::Key);
                        s.current_key_start = i;
                        s.current_key_len = 1;
                        s.consumed_at_least_one = true;
                        continue;
                    }

                    if s.state == State::Key {
                        s.current_key_len += 1;
                        continue;
                    }

                    if s.expecting_end_of_value {
                        parse_error!(s, "invalid character");
                    }

                    if s.state == State::Value || s.state == State::LoadableEntryTitle {
                        if s.consumed_at_least_one {
                            s.current_value_len += 1;
                        } else {
                            s.current_value_start = i;
                            s.current_value_len = 1;
                        }
                        s.consumed_at_least_one = true;
                        continue;
                    }

                    parse_error!(s, "invalid character");
                }
            }
        }

        if s.state == State::Value {
            finalize_key_value(source, &mut s, &mut entries, false)?;
        } else if s.expecting_depth_plus_one || (s.within_loadable_entry && !s.consumed_at_least_one_kv) {
            parse_error!(s, "unexpected end of input");
        } else if s.state != State::Comment && s.state != State::Normal {
            parse_error!(s, "unexpected end of input");
        }

        Ok(Config {
            entries,
            first_loadable_entry,
            last_loadable_entry,
        })
    }
}
