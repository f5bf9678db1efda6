use std::collections::HashSet;

use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use serde::{Deserialize, Serialize};

use crate::error::{BundleDefect, DuplicateOrigin, MigrationError, MigrationResult};
use crate::preferences::PREFERENCES_TABLE;

const ROOT: &str = "preferences";
const ENTRY: &str = "preference";
const NAME: &str = "preferenceName";
const VALUE: &str = "preferenceValue";
const NULL_ATTR: &str = "null";

/// Value side of a preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "text", rename_all = "snake_case")]
pub enum PreferenceValue {
    /// The preference does not exist in the source environment.
    Absent,
    /// The preference exists with a NULL value. Written as
    /// `<preferenceValue null="true"/>`, distinct from an empty string.
    Null,
    Text(String),
}

/// One exported system preference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preference {
    pub name: String,
    pub value: PreferenceValue,
}

impl Preference {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: PreferenceValue::Text(value.into()),
        }
    }

    pub fn null(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: PreferenceValue::Null,
        }
    }

    pub fn absent(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: PreferenceValue::Absent,
        }
    }
}

pub fn encode_preferences(preferences: &[Preference]) -> MigrationResult<Vec<u8>> {
    let mut sorted: Vec<&Preference> = preferences.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));

    let mut writer = Writer::new(Vec::new());
    let mut emit = |event: Event<'_>| {
        writer
            .write_event(event)
            .map_err(|err| MigrationError::Encode(err.to_string()))
    };
    emit(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
    emit(Event::Start(BytesStart::new(ROOT)))?;
    for preference in sorted {
        emit(Event::Start(BytesStart::new(ENTRY)))?;
        emit(Event::Start(BytesStart::new(NAME)))?;
        emit(Event::Text(BytesText::new(&preference.name)))?;
        emit(Event::End(BytesEnd::new(NAME)))?;
        match &preference.value {
            PreferenceValue::Absent => {}
            PreferenceValue::Null => {
                emit(Event::Empty(
                    BytesStart::new(VALUE).with_attributes([(NULL_ATTR, "true")]),
                ))?;
            }
            PreferenceValue::Text(value) => {
                emit(Event::Start(BytesStart::new(VALUE)))?;
                emit(Event::Text(BytesText::new(value)))?;
                emit(Event::End(BytesEnd::new(VALUE)))?;
            }
        }
        emit(Event::End(BytesEnd::new(ENTRY)))?;
    }
    emit(Event::End(BytesEnd::new(ROOT)))?;
    Ok(writer.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Name,
    Value,
}

#[derive(Default)]
struct Pending {
    name: Option<String>,
    value: Option<String>,
    null: bool,
}

/// Streaming state for the three-level preference document.
#[derive(Default)]
struct PreferenceParser {
    depth: usize,
    current: Option<Pending>,
    field: Option<Field>,
    text: String,
    parsed: Vec<Preference>,
}

impl PreferenceParser {
    fn open(&mut self, element: &str, null: bool) -> Result<(), String> {
        match (self.depth, element) {
            (0, ROOT) => {}
            (1, ENTRY) => self.current = Some(Pending::default()),
            (2, NAME) => self.field = Some(Field::Name),
            (2, VALUE) => {
                self.field = Some(Field::Value);
                if let Some(pending) = self.current.as_mut() {
                    pending.null = null;
                }
            }
            (depth, other) => {
                return Err(format!("unexpected element <{other}> at depth {depth}"));
            }
        }
        self.text.clear();
        self.depth += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), String> {
        self.depth = self.depth.saturating_sub(1);
        match self.depth {
            2 => {
                let text = std::mem::take(&mut self.text);
                if let Some(pending) = self.current.as_mut() {
                    match self.field.take() {
                        Some(Field::Name) => pending.name = Some(text),
                        Some(Field::Value) => pending.value = Some(text),
                        None => {}
                    }
                }
            }
            1 => {
                let pending = self.current.take().unwrap_or_default();
                let name = pending
                    .name
                    .filter(|name| !name.is_empty())
                    .ok_or_else(|| {
                        format!("preference #{} has no {NAME}", self.parsed.len() + 1)
                    })?;
                let value = match (pending.null, pending.value) {
                    (true, _) => PreferenceValue::Null,
                    (false, Some(text)) => PreferenceValue::Text(text),
                    (false, None) => PreferenceValue::Absent,
                };
                self.parsed.push(Preference { name, value });
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, text: &str) -> Result<(), String> {
        if self.field.is_some() {
            self.text.push_str(text);
            Ok(())
        } else if text.trim().is_empty() {
            Ok(())
        } else {
            Err(format!("unexpected text {:?} outside a preference field", text.trim()))
        }
    }
}

/// Parses the flat preference document. A `preference` without a
/// `preferenceValue` element decodes to [`Preference::absent`]; one whose
/// value carries `null="true"` decodes to [`Preference::null`].
pub fn decode_preferences(bytes: &[u8]) -> MigrationResult<Vec<Preference>> {
    let markup = |detail: String| MigrationError::malformed(BundleDefect::Markup { detail });
    let document = std::str::from_utf8(bytes)
        .map_err(|err| markup(format!("document is not UTF-8: {err}")))?;

    let mut reader = Reader::from_str(document);
    let mut parser = PreferenceParser::default();
    let mut saw_root = false;
    loop {
        let step = match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                saw_root = true;
                element_name(e).and_then(|name| parser.open(&name, null_flag(e)?))
            }
            Ok(Event::Empty(ref e)) => {
                saw_root = true;
                element_name(e)
                    .and_then(|name| parser.open(&name, null_flag(e)?))
                    .and_then(|_| parser.close())
            }
            Ok(Event::End(_)) => parser.close(),
            Ok(Event::Text(ref e)) => e
                .unescape()
                .map_err(|err| err.to_string())
                .and_then(|text| parser.text(&text)),
            Ok(Event::CData(ref e)) => std::str::from_utf8(e)
                .map_err(|err| err.to_string())
                .and_then(|text| parser.text(text)),
            Ok(Event::Eof) => break,
            Ok(_) => Ok(()),
            Err(err) => Err(format!(
                "parse error at byte {}: {err}",
                reader.buffer_position()
            )),
        };
        step.map_err(markup)?;
    }
    if !saw_root {
        return Err(markup(format!("document has no <{ROOT}> element")));
    }
    if parser.depth != 0 {
        return Err(markup("document ends inside an open element".to_string()));
    }

    let mut seen = HashSet::new();
    for preference in &parser.parsed {
        if !seen.insert(preference.name.as_str()) {
            return Err(MigrationError::DuplicateBusinessKey {
                table: PREFERENCES_TABLE.to_string(),
                business_key: preference.name.clone(),
                origin: DuplicateOrigin::Bundle,
            });
        }
    }
    Ok(parser.parsed)
}

fn element_name(e: &BytesStart<'_>) -> Result<String, String> {
    std::str::from_utf8(e.local_name().as_ref())
        .map(str::to_string)
        .map_err(|err| err.to_string())
}

fn null_flag(e: &BytesStart<'_>) -> Result<bool, String> {
    let attribute = e
        .try_get_attribute(NULL_ATTR)
        .map_err(|err| err.to_string())?;
    match attribute.as_ref().map(|a| a.value.as_ref()) {
        None | Some(b"false") => Ok(false),
        Some(b"true") => Ok(true),
        Some(other) => Err(format!(
            "{NULL_ATTR} attribute must be \"true\" or \"false\", found {:?}",
            String::from_utf8_lossy(other)
        )),
    }
}
