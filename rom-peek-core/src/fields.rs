//! The output data model: descriptive fields and metadata properties.
//!
//! A parser fills a [`RomFields`] builder in display order; hosts render
//! the fields as-is. Field values are a tagged union so hosts can pick
//! an appropriate widget (hex view for dumps, table for list data).

use serde::Serialize;

bitflags::bitflags! {
    /// Per-field display flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
    pub struct FieldFlags: u8 {
        /// Trim trailing whitespace when rendering.
        const TRIM_END = 1 << 0;
        /// Render in a monospace face (hex values, IDs).
        const MONOSPACE = 1 << 1;
        /// Highlight as a warning (bad checksum, missing keys).
        const WARNING = 1 << 2;
    }
}

/// Numeric display base.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum NumericBase {
    Decimal,
    Hex,
}

/// One entry of a per-rating-slot age classification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AgeRating {
    /// Slot carries a rating at all.
    pub active: bool,
    /// Rating is pending.
    pub pending: bool,
    /// Explicitly "no age restriction".
    pub no_restriction: bool,
    /// Minimum age, when `active` and not `pending`/`no_restriction`.
    pub age: u8,
}

/// Tabular sub-data attached to a single field.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListData {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
    pub row_flags: Vec<FieldFlags>,
}

/// A field value.
#[derive(Debug, Clone, Serialize)]
pub enum FieldValue {
    Text(String),
    Numeric {
        value: u64,
        base: NumericBase,
        digits: u8,
    },
    /// UTC Unix seconds; -1 means "could not be converted".
    DateTime(i64),
    Bitfield {
        bits: u32,
        labels: Vec<&'static str>,
    },
    AgeRatings([AgeRating; 16]),
    List(ListData),
    HexDump(Vec<u8>),
}

/// A named field plus display flags and tab assignment.
#[derive(Debug, Clone, Serialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
    pub flags: FieldFlags,
    pub tab: usize,
}

/// Ordered field collection with optional named tabs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RomFields {
    fields: Vec<Field>,
    tabs: Vec<String>,
    current_tab: usize,
}

impl RomFields {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new tab; subsequent fields land in it.
    pub fn add_tab(&mut self, name: impl Into<String>) -> usize {
        self.tabs.push(name.into());
        self.current_tab = self.tabs.len() - 1;
        self.current_tab
    }

    pub fn tabs(&self) -> &[String] {
        &self.tabs
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Look up a field by name (first match).
    pub fn get(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name == name)
    }

    fn push(&mut self, name: impl Into<String>, value: FieldValue, flags: FieldFlags) {
        self.fields.push(Field {
            name: name.into(),
            value,
            flags,
            tab: self.current_tab,
        });
    }

    pub fn add_text(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.push(name, FieldValue::Text(text.into()), FieldFlags::empty());
    }

    pub fn add_text_flags(
        &mut self,
        name: impl Into<String>,
        text: impl Into<String>,
        flags: FieldFlags,
    ) {
        self.push(name, FieldValue::Text(text.into()), flags);
    }

    /// Warning text, pre-flagged.
    pub fn add_warning(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.push(name, FieldValue::Text(text.into()), FieldFlags::WARNING);
    }

    pub fn add_numeric(&mut self, name: impl Into<String>, value: u64) {
        self.push(
            name,
            FieldValue::Numeric {
                value,
                base: NumericBase::Decimal,
                digits: 0,
            },
            FieldFlags::empty(),
        );
    }

    pub fn add_hex(&mut self, name: impl Into<String>, value: u64, digits: u8) {
        self.push(
            name,
            FieldValue::Numeric {
                value,
                base: NumericBase::Hex,
                digits,
            },
            FieldFlags::MONOSPACE,
        );
    }

    pub fn add_datetime(&mut self, name: impl Into<String>, unix: i64) {
        self.push(name, FieldValue::DateTime(unix), FieldFlags::empty());
    }

    pub fn add_bitfield(
        &mut self,
        name: impl Into<String>,
        bits: u32,
        labels: Vec<&'static str>,
    ) {
        self.push(
            name,
            FieldValue::Bitfield { bits, labels },
            FieldFlags::empty(),
        );
    }

    pub fn add_age_ratings(&mut self, name: impl Into<String>, ratings: [AgeRating; 16]) {
        self.push(name, FieldValue::AgeRatings(ratings), FieldFlags::empty());
    }

    pub fn add_list(&mut self, name: impl Into<String>, list: ListData) {
        self.push(name, FieldValue::List(list), FieldFlags::empty());
    }

    pub fn add_hexdump(&mut self, name: impl Into<String>, bytes: Vec<u8>) {
        self.push(name, FieldValue::HexDump(bytes), FieldFlags::MONOSPACE);
    }

    /// Copy another builder's fields into the current tab, preserving
    /// their order. Used to nest a sub-parser's output as a tab.
    pub fn extend_from(&mut self, other: &RomFields) {
        for field in other.fields() {
            self.fields.push(Field {
                tab: self.current_tab,
                ..field.clone()
            });
        }
    }
}

/// Property tags for the short metadata list consumed by file indexers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Property {
    Title,
    Publisher,
    CreationDate,
    GameId,
    OsVersion,
}

/// Metadata value: text or UTC Unix timestamp.
#[derive(Debug, Clone, Serialize)]
pub enum MetaValue {
    Text(String),
    Timestamp(i64),
}

/// Ordered `(property, value)` pairs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RomMetaData {
    entries: Vec<(Property, MetaValue)>,
}

impl RomMetaData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[(Property, MetaValue)] {
        &self.entries
    }

    pub fn add_text(&mut self, prop: Property, text: impl Into<String>) {
        self.entries.push((prop, MetaValue::Text(text.into())));
    }

    pub fn add_timestamp(&mut self, prop: Property, unix: i64) {
        self.entries.push((prop, MetaValue::Timestamp(unix)));
    }

    pub fn get(&self, prop: Property) -> Option<&MetaValue> {
        self.entries
            .iter()
            .find(|(p, _)| *p == prop)
            .map(|(_, v)| v)
    }
}
