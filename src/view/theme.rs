use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::ops::Range;
use std::sync::Arc;
use uuid::Uuid;

use crate::model::scope::GLOBAL_SCOPE;
use crate::model::scoped_string::ScopedString;

/// Theme error types
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThemeError {
    MissingKey(&'static str),
    InvalidUuid(String),
    Malformed(String),
}

impl fmt::Display for ThemeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThemeError::MissingKey(key) => write!(f, "Missing theme key: {key}"),
            ThemeError::InvalidUuid(uuid) => write!(f, "Invalid theme uuid: {uuid}"),
            ThemeError::Malformed(msg) => write!(f, "Malformed theme: {msg}"),
        }
    }
}

impl std::error::Error for ThemeError {}

/// RGBA color
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
    pub a: u8,
}

impl Color {
    pub const fn rgb(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b, a: 0xff }
    }

    /// Parse `#RGB`, `#RRGGBB` or `#RRGGBBAA`.
    pub fn from_hex(hex: &str) -> Option<Self> {
        let digits = hex.trim().strip_prefix('#')?;
        if !digits.is_ascii() {
            return None;
        }
        let byte = |i: usize| u8::from_str_radix(digits.get(i..i + 2)?, 16).ok();
        match digits.len() {
            3 => {
                let nibble = |i: usize| {
                    let v = u8::from_str_radix(digits.get(i..i + 1)?, 16).ok()?;
                    Some(v * 0x11)
                };
                Some(Self::rgb(nibble(0)?, nibble(1)?, nibble(2)?))
            }
            6 => Some(Self::rgb(byte(0)?, byte(2)?, byte(4)?)),
            8 => Some(Self {
                r: byte(0)?,
                g: byte(2)?,
                b: byte(4)?,
                a: byte(6)?,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct FontStyle {
    pub bold: bool,
    pub italic: bool,
    pub underline: bool,
    pub strikethrough: bool,
}

impl FontStyle {
    /// Parse a space separated list such as `"bold italic"`. `"plain"` and
    /// the empty string clear every flag; unknown words are ignored.
    pub fn parse(value: &str) -> Self {
        let mut style = Self::default();
        for word in value.split_whitespace() {
            match word {
                "bold" => style.bold = true,
                "italic" => style.italic = true,
                "underline" => style.underline = true,
                "strikethrough" => style.strikethrough = true,
                "plain" => style = Self::default(),
                other => tracing::debug!("Ignoring font style {:?}", other),
            }
        }
        style
    }
}

/// Display attributes assigned to a scope by a theme.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Attributes {
    pub foreground: Option<Color>,
    pub background: Option<Color>,
    pub caret: Option<Color>,
    pub selection: Option<Color>,
    pub invisibles: Option<Color>,
    pub line_highlight: Option<Color>,
    pub font_style: Option<FontStyle>,
    pub font_name: Option<String>,
    pub font_size: Option<f64>,
    /// Keys without a typed field, kept verbatim.
    pub other: BTreeMap<String, String>,
}

impl Attributes {
    fn from_settings(settings: &Map<String, Value>) -> Self {
        let mut attributes = Self::default();
        for (key, value) in settings {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let color = || Color::from_hex(&text);
            let typed = match key.as_str() {
                "foreground" => color().map(|c| attributes.foreground = Some(c)),
                "background" => color().map(|c| attributes.background = Some(c)),
                "caret" => color().map(|c| attributes.caret = Some(c)),
                "selection" => color().map(|c| attributes.selection = Some(c)),
                "invisibles" => color().map(|c| attributes.invisibles = Some(c)),
                "lineHighlight" => color().map(|c| attributes.line_highlight = Some(c)),
                "fontStyle" => {
                    attributes.font_style = Some(FontStyle::parse(&text));
                    Some(())
                }
                "fontName" => {
                    attributes.font_name = Some(text.clone());
                    Some(())
                }
                "fontSize" => value
                    .as_f64()
                    .or_else(|| text.parse().ok())
                    .map(|size| attributes.font_size = Some(size)),
                _ => None,
            };
            if typed.is_none() {
                attributes.other.insert(key.clone(), text);
            }
        }
        attributes
    }

    /// `self` with every attribute set in `over` replaced by `over`'s value.
    pub fn merged_with(&self, over: &Attributes) -> Attributes {
        let mut other = self.other.clone();
        other.extend(over.other.iter().map(|(k, v)| (k.clone(), v.clone())));
        Attributes {
            foreground: over.foreground.or(self.foreground),
            background: over.background.or(self.background),
            caret: over.caret.or(self.caret),
            selection: over.selection.or(self.selection),
            invisibles: over.invisibles.or(self.invisibles),
            line_highlight: over.line_highlight.or(self.line_highlight),
            font_style: over.font_style.or(self.font_style),
            font_name: over.font_name.clone().or_else(|| self.font_name.clone()),
            font_size: over.font_size.or(self.font_size),
            other,
        }
    }
}

/// Serializable theme definition (matches the `.tmTheme.json` structure)
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ThemeFile {
    uuid: Option<String>,
    name: Option<String>,
    semantic_class: Option<String>,
    #[serde(default)]
    gutter_settings: Map<String, Value>,
    settings: Option<Vec<Value>>,
}

#[derive(Debug, Clone, Deserialize)]
struct SettingsEntry {
    scope: Option<String>,
    #[serde(default)]
    settings: Map<String, Value>,
}

/// A resolved theme: display attributes keyed by exact scope name.
#[derive(Debug, Clone)]
pub struct Theme {
    pub uuid: Uuid,
    pub name: String,
    pub semantic_class: Option<String>,
    pub gutter_settings: Attributes,
    attributes: HashMap<String, Arc<Attributes>>,
}

impl TryFrom<ThemeFile> for Theme {
    type Error = ThemeError;

    fn try_from(file: ThemeFile) -> Result<Self, Self::Error> {
        let uuid = file.uuid.ok_or(ThemeError::MissingKey("uuid"))?;
        let uuid = Uuid::parse_str(&uuid).map_err(|_| ThemeError::InvalidUuid(uuid))?;
        let name = file.name.ok_or(ThemeError::MissingKey("name"))?;
        let settings = file.settings.ok_or(ThemeError::MissingKey("settings"))?;

        let mut attributes: HashMap<String, Attributes> = HashMap::new();
        for value in settings {
            let entry: SettingsEntry = match serde_json::from_value(value) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping malformed theme entry in {}: {}", name, e);
                    continue;
                }
            };
            let parsed = Attributes::from_settings(&entry.settings);
            let keys: Vec<String> = match &entry.scope {
                Some(scope) => scope
                    .split(',')
                    .map(str::trim)
                    .filter(|key| !key.is_empty())
                    .map(str::to_string)
                    .collect(),
                None => vec![GLOBAL_SCOPE.to_string()],
            };
            for key in keys {
                let merged = match attributes.get(&key) {
                    Some(existing) => existing.merged_with(&parsed),
                    None => parsed.clone(),
                };
                attributes.insert(key, merged);
            }
        }

        Ok(Theme {
            uuid,
            name,
            semantic_class: file.semantic_class,
            gutter_settings: Attributes::from_settings(&file.gutter_settings),
            attributes: attributes
                .into_iter()
                .map(|(key, value)| (key, Arc::new(value)))
                .collect(),
        })
    }
}

/// A maximal run of text sharing the same merged attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributedRun {
    pub range: Range<usize>,
    pub attributes: Attributes,
}

impl Theme {
    pub fn from_value(value: Value) -> Result<Self, ThemeError> {
        let file: ThemeFile =
            serde_json::from_value(value).map_err(|e| ThemeError::Malformed(e.to_string()))?;
        Theme::try_from(file)
    }

    pub fn from_json(json: &str) -> Result<Self, ThemeError> {
        let value = serde_json::from_str(json).map_err(|e| ThemeError::Malformed(e.to_string()))?;
        Self::from_value(value)
    }

    /// Attributes for exactly `scope_name`.
    pub fn attributes_for(&self, scope_name: &str) -> Option<&Arc<Attributes>> {
        self.attributes.get(scope_name)
    }

    /// Attributes of the entry without a scope selector.
    pub fn global_settings(&self) -> Option<&Arc<Attributes>> {
        self.attributes.get(GLOBAL_SCOPE)
    }

    /// Number of distinct scope keys, the global entry included.
    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }

    /// Attach this theme's attributes to every scope of `scoped` that has an
    /// entry.
    pub fn annotate(&self, scoped: &mut ScopedString) {
        scoped.for_each_scope_mut(|scope| {
            scope.attribute = self.attributes.get(&*scope.identifier).cloned();
        });
    }

    /// Split the text of `scoped` into runs of equal merged attributes.
    ///
    /// Each run starts from the global settings and applies the attributes of
    /// its scopes from outermost to innermost. Adjacent runs with equal
    /// attributes are merged.
    pub fn attributed_runs(&self, scoped: &ScopedString) -> Vec<AttributedRun> {
        let mut boundaries: Vec<usize> = vec![0, scoped.len()];
        for (_, scope) in scoped.iter() {
            boundaries.push(scope.range.start);
            boundaries.push(scope.range.end);
        }
        boundaries.sort_unstable();
        boundaries.dedup();

        let base = self.global_settings().map(|g| (**g).clone()).unwrap_or_default();
        let mut runs: Vec<AttributedRun> = Vec::new();
        for pair in boundaries.windows(2) {
            let range = pair[0]..pair[1];
            if range.is_empty() {
                continue;
            }
            let attributes = scoped
                .scope_stack(range.start)
                .into_iter()
                .filter_map(|scope| self.attributes_for(&scope.identifier))
                .fold(base.clone(), |acc, over| acc.merged_with(over));

            match runs.last_mut() {
                Some(last) if last.attributes == attributes => last.range.end = range.end,
                _ => runs.push(AttributedRun { range, attributes }),
            }
        }
        runs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::scope::Scope;
    use serde_json::json;

    fn sample() -> Value {
        json!({
            "uuid": "8E1A2C3B-4D5E-4F60-8172-93A4B5C6D7E8",
            "name": "Sample",
            "semanticClass": "theme.dark.sample",
            "gutterSettings": { "foreground": "#888" },
            "settings": [
                {
                    "settings": {
                        "foreground": "#F8F8F2",
                        "background": "#272822",
                        "caret": "#F8F8F0"
                    }
                },
                {
                    "name": "Comment",
                    "scope": "comment",
                    "settings": { "foreground": "#75715E", "fontStyle": "italic" }
                },
                {
                    "name": "Strings",
                    "scope": "string, string.quoted ,",
                    "settings": { "foreground": "#E6DB74" }
                },
                {
                    "name": "Numbers",
                    "scope": "constant.numeric",
                    "settings": { "foreground": "#AE81FF", "fontSize": 12, "tabSize": 4 }
                },
                { "name": "Broken", "scope": "broken", "settings": "not a map" }
            ]
        })
    }

    #[test]
    fn test_color_from_hex() {
        assert_eq!(Color::from_hex("#fff"), Some(Color::rgb(255, 255, 255)));
        assert_eq!(Color::from_hex("#272822"), Some(Color::rgb(0x27, 0x28, 0x22)));
        assert_eq!(
            Color::from_hex("#27282280"),
            Some(Color {
                r: 0x27,
                g: 0x28,
                b: 0x22,
                a: 0x80
            })
        );
        assert_eq!(Color::from_hex("272822"), None);
        assert_eq!(Color::from_hex("#zzz"), None);
        assert_eq!(Color::from_hex("#é12"), None);
    }

    #[test]
    fn test_font_style() {
        assert_eq!(
            FontStyle::parse("bold italic"),
            FontStyle {
                bold: true,
                italic: true,
                ..Default::default()
            }
        );
        assert_eq!(FontStyle::parse("plain"), FontStyle::default());
    }

    #[test]
    fn test_theme_lookup() {
        let theme = Theme::from_value(sample()).unwrap();
        assert_eq!(theme.name, "Sample");
        assert_eq!(theme.semantic_class.as_deref(), Some("theme.dark.sample"));
        assert_eq!(theme.gutter_settings.foreground, Some(Color::rgb(0x88, 0x88, 0x88)));

        let global = theme.global_settings().unwrap();
        assert_eq!(global.background, Some(Color::rgb(0x27, 0x28, 0x22)));

        let comment = theme.attributes_for("comment").unwrap();
        assert_eq!(comment.font_style.map(|s| s.italic), Some(true));
        assert!(theme.attributes_for("comment.line").is_none());

        // Comma separated selectors map to the same attributes.
        assert_eq!(
            theme.attributes_for("string.quoted"),
            theme.attributes_for("string")
        );

        let numbers = theme.attributes_for("constant.numeric").unwrap();
        assert_eq!(numbers.font_size, Some(12.0));
        assert_eq!(numbers.other.get("tabSize").map(String::as_str), Some("4"));

        assert!(theme.attributes_for("broken").is_none());
        assert_eq!(theme.len(), 5);
    }

    #[test]
    fn test_missing_keys() {
        let mut value = sample();
        value.as_object_mut().unwrap().remove("settings");
        assert_eq!(
            Theme::from_value(value).unwrap_err(),
            ThemeError::MissingKey("settings")
        );

        let mut value = sample();
        value["uuid"] = json!("nope");
        assert!(matches!(Theme::from_value(value), Err(ThemeError::InvalidUuid(_))));
    }

    #[test]
    fn test_attributed_runs() {
        let theme = Theme::from_value(sample()).unwrap();
        let mut scoped = ScopedString::new("ab \"1\" cd");
        scoped.add(Scope::new("string", 3..6), 0);
        scoped.add(Scope::new("constant.numeric", 4..5), 1);
        scoped.add(Scope::new("unknown", 7..9), 0);

        let runs = theme.attributed_runs(&scoped);
        let ranges: Vec<_> = runs.iter().map(|r| r.range.clone()).collect();
        // `unknown` has no entry, so 6..9 keeps the global attributes.
        assert_eq!(ranges, vec![0..3, 3..4, 4..5, 5..6, 6..9]);
        assert_eq!(runs[1].attributes.foreground, Some(Color::rgb(0xE6, 0xDB, 0x74)));
        assert_eq!(runs[2].attributes.foreground, Some(Color::rgb(0xAE, 0x81, 0xFF)));
        assert_eq!(runs[2].attributes.background, Some(Color::rgb(0x27, 0x28, 0x22)));
        assert_eq!(runs[0].attributes, runs[4].attributes);
    }

    #[test]
    fn test_annotate() {
        let theme = Theme::from_value(sample()).unwrap();
        let mut scoped = ScopedString::new("# hi");
        scoped.add(Scope::new("comment", 0..4), 0);
        theme.annotate(&mut scoped);
        let (_, scope) = scoped.iter().next().unwrap();
        assert_eq!(scope.attribute.as_deref(), theme.attributes_for("comment").map(|a| &**a));
    }
}
