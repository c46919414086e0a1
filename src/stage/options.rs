//! Stage option schemas and resolution
//!
//! Every stage declares the options it understands in an [`OptionSchema`]:
//! name, type and default. At load time the registry resolves the schema
//! against a deep copy of the flow-wide defaults overlaid with the settings
//! keyed by the stage's qualified name. The stage owns the resulting
//! [`StageOptions`]; nothing it does to them is visible to other stages.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use thiserror::Error;
use toml::{Table, Value};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum OptionError {
    #[error("stage '{stage}': required option '{option}' is not set")]
    Missing { stage: String, option: String },

    #[error("stage '{stage}': option '{option}' is invalid: {reason}")]
    Invalid {
        stage: String,
        option: String,
        reason: String,
    },

    #[error("stage '{stage}' does not understand option '{option}'")]
    Unknown { stage: String, option: String },

    #[error("option '{option}' is not a {expected}")]
    WrongType { option: String, expected: OptionKind },
}

/// Declared type of an option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptionKind {
    Str,
    Int,
    Float,
    Bool,
    /// Byte count; accepts `K/M/G/T` suffixes
    Size,
    /// Accepts `s/m/h/d/w` suffixes, plain numbers are seconds
    Duration,
    /// List of strings; a string value is split on commas and whitespace
    List,
}

impl fmt::Display for OptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OptionKind::Str => "string",
            OptionKind::Int => "integer",
            OptionKind::Float => "number",
            OptionKind::Bool => "flag",
            OptionKind::Size => "size",
            OptionKind::Duration => "duration",
            OptionKind::List => "list",
        };
        f.write_str(name)
    }
}

/// A resolved option value
#[derive(Debug, Clone, PartialEq)]
pub enum OptionValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
    Size(u64),
    Duration(Duration),
    List(Vec<String>),
}

impl OptionValue {
    pub fn kind(&self) -> OptionKind {
        match self {
            OptionValue::Str(_) => OptionKind::Str,
            OptionValue::Int(_) => OptionKind::Int,
            OptionValue::Float(_) => OptionKind::Float,
            OptionValue::Bool(_) => OptionKind::Bool,
            OptionValue::Size(_) => OptionKind::Size,
            OptionValue::Duration(_) => OptionKind::Duration,
            OptionValue::List(_) => OptionKind::List,
        }
    }
}

impl fmt::Display for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::Str(s) => write!(f, "{}", s),
            OptionValue::Int(i) => write!(f, "{}", i),
            OptionValue::Float(x) => write!(f, "{}", x),
            OptionValue::Bool(b) => write!(f, "{}", b),
            OptionValue::Size(n) => write!(f, "{}", n),
            OptionValue::Duration(d) => write!(f, "{}s", d.as_secs_f64()),
            OptionValue::List(items) => write!(f, "{}", items.join(",")),
        }
    }
}

/// One declared option
#[derive(Debug, Clone, PartialEq)]
pub struct OptionSpec {
    pub name: &'static str,
    pub kind: OptionKind,
    pub default: Option<OptionValue>,
    pub required: bool,
    pub help: &'static str,
}

/// The options a stage understands
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionSchema {
    specs: Vec<OptionSpec>,
}

impl OptionSchema {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an option with a default value
    pub fn option(
        mut self,
        name: &'static str,
        kind: OptionKind,
        default: OptionValue,
        help: &'static str,
    ) -> Self {
        self.specs.push(OptionSpec {
            name,
            kind,
            default: Some(default),
            required: false,
            help,
        });
        self
    }

    /// Declare an option that must be configured
    pub fn required(mut self, name: &'static str, kind: OptionKind, help: &'static str) -> Self {
        self.specs.push(OptionSpec {
            name,
            kind,
            default: None,
            required: true,
            help,
        });
        self
    }

    /// Declare an option with no default that may stay unset
    pub fn optional(mut self, name: &'static str, kind: OptionKind, help: &'static str) -> Self {
        self.specs.push(OptionSpec {
            name,
            kind,
            default: None,
            required: false,
            help,
        });
        self
    }

    pub fn specs(&self) -> &[OptionSpec] {
        &self.specs
    }

    pub fn get(&self, name: &str) -> Option<&OptionSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Resolve this schema for `stage`.
    ///
    /// `defaults` is copied, then every key of `overrides` replaces the
    /// corresponding default. Flow defaults may carry options meant for other
    /// stages and are ignored when undeclared; an undeclared key in the
    /// stage's own overrides is an error.
    pub fn resolve(
        &self,
        stage: &str,
        defaults: &Table,
        overrides: Option<&Table>,
    ) -> Result<StageOptions, OptionError> {
        let mut merged = defaults.clone();
        if let Some(overrides) = overrides {
            for (key, value) in overrides {
                if self.get(key).is_none() {
                    return Err(OptionError::Unknown {
                        stage: stage.to_string(),
                        option: key.clone(),
                    });
                }
                merged.insert(key.clone(), value.clone());
            }
        }

        let mut values = BTreeMap::new();
        for spec in &self.specs {
            let value = match merged.get(spec.name) {
                Some(raw) => convert(spec.kind, raw).map_err(|reason| OptionError::Invalid {
                    stage: stage.to_string(),
                    option: spec.name.to_string(),
                    reason,
                })?,
                None => match &spec.default {
                    Some(default) => default.clone(),
                    None if spec.required => {
                        return Err(OptionError::Missing {
                            stage: stage.to_string(),
                            option: spec.name.to_string(),
                        })
                    }
                    None => continue,
                },
            };
            values.insert(spec.name.to_string(), value);
        }

        Ok(StageOptions {
            stage: stage.to_string(),
            values,
        })
    }
}

/// Options resolved for one stage instance
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOptions {
    stage: String,
    values: BTreeMap<String, OptionValue>,
}

impl StageOptions {
    /// Options built directly from values, bypassing any schema
    pub fn from_values(
        stage: impl Into<String>,
        values: impl IntoIterator<Item = (&'static str, OptionValue)>,
    ) -> Self {
        Self {
            stage: stage.into(),
            values: values
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        }
    }

    /// Qualified name of the stage these options were resolved for
    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn get(&self, name: &str) -> Option<&OptionValue> {
        self.values.get(name)
    }

    pub fn is_set(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn set(&mut self, name: impl Into<String>, value: OptionValue) {
        self.values.insert(name.into(), value);
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &OptionValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v))
    }

    fn require(&self, name: &str) -> Result<&OptionValue, OptionError> {
        self.values.get(name).ok_or_else(|| OptionError::Missing {
            stage: self.stage.clone(),
            option: name.to_string(),
        })
    }

    fn wrong(name: &str, expected: OptionKind) -> OptionError {
        OptionError::WrongType {
            option: name.to_string(),
            expected,
        }
    }

    pub fn string(&self, name: &str) -> Result<&str, OptionError> {
        match self.require(name)? {
            OptionValue::Str(s) => Ok(s),
            _ => Err(Self::wrong(name, OptionKind::Str)),
        }
    }

    pub fn int(&self, name: &str) -> Result<i64, OptionError> {
        match self.require(name)? {
            OptionValue::Int(i) => Ok(*i),
            _ => Err(Self::wrong(name, OptionKind::Int)),
        }
    }

    pub fn float(&self, name: &str) -> Result<f64, OptionError> {
        match self.require(name)? {
            OptionValue::Float(x) => Ok(*x),
            OptionValue::Int(i) => Ok(*i as f64),
            _ => Err(Self::wrong(name, OptionKind::Float)),
        }
    }

    pub fn flag(&self, name: &str) -> Result<bool, OptionError> {
        match self.require(name)? {
            OptionValue::Bool(b) => Ok(*b),
            _ => Err(Self::wrong(name, OptionKind::Bool)),
        }
    }

    pub fn size(&self, name: &str) -> Result<u64, OptionError> {
        match self.require(name)? {
            OptionValue::Size(n) => Ok(*n),
            _ => Err(Self::wrong(name, OptionKind::Size)),
        }
    }

    pub fn duration(&self, name: &str) -> Result<Duration, OptionError> {
        match self.require(name)? {
            OptionValue::Duration(d) => Ok(*d),
            _ => Err(Self::wrong(name, OptionKind::Duration)),
        }
    }

    pub fn list(&self, name: &str) -> Result<&[String], OptionError> {
        match self.require(name)? {
            OptionValue::List(items) => Ok(items),
            _ => Err(Self::wrong(name, OptionKind::List)),
        }
    }
}

fn convert(kind: OptionKind, raw: &Value) -> Result<OptionValue, String> {
    match (kind, raw) {
        (OptionKind::Str, Value::String(s)) => Ok(OptionValue::Str(s.clone())),
        (OptionKind::Int, Value::Integer(i)) => Ok(OptionValue::Int(*i)),
        (OptionKind::Float, Value::Float(x)) => Ok(OptionValue::Float(*x)),
        (OptionKind::Float, Value::Integer(i)) => Ok(OptionValue::Float(*i as f64)),
        (OptionKind::Bool, Value::Boolean(b)) => Ok(OptionValue::Bool(*b)),
        (OptionKind::Bool, Value::String(s)) => parse_flag(s).map(OptionValue::Bool),
        (OptionKind::Size, Value::Integer(i)) => u64::try_from(*i)
            .map(OptionValue::Size)
            .map_err(|_| format!("size {} is negative", i)),
        (OptionKind::Size, Value::String(s)) => parse_size(s).map(OptionValue::Size),
        (OptionKind::Duration, Value::Integer(i)) => u64::try_from(*i)
            .map(|secs| OptionValue::Duration(Duration::from_secs(secs)))
            .map_err(|_| format!("duration {} is negative", i)),
        (OptionKind::Duration, Value::Float(x)) if x.is_finite() && *x >= 0.0 => {
            Ok(OptionValue::Duration(Duration::from_secs_f64(*x)))
        }
        (OptionKind::Duration, Value::String(s)) => parse_duration(s).map(OptionValue::Duration),
        (OptionKind::List, Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.clone()),
                other => Err(format!("list item {} is not a string", other)),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(OptionValue::List),
        (OptionKind::List, Value::String(s)) => Ok(OptionValue::List(
            s.split(|c: char| c == ',' || c.is_whitespace())
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
        )),
        (kind, other) => Err(format!("expected a {}, found {}", kind, other.type_str())),
    }
}

fn parse_flag(value: &str) -> Result<bool, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Ok(true),
        "false" | "no" | "off" | "0" => Ok(false),
        other => Err(format!("'{}' is not a flag value", other)),
    }
}

fn split_suffix(value: &str) -> (&str, &str) {
    let value = value.trim();
    let split = value
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(value.len());
    (&value[..split], value[split..].trim())
}

/// Parse a byte count such as `512`, `10k`, `1M` or `2Gb` (powers of 1024)
pub fn parse_size(value: &str) -> Result<u64, String> {
    let (number, suffix) = split_suffix(value);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("'{}' is not a size", value))?;

    let suffix = suffix.to_ascii_lowercase();
    let unit = suffix.strip_suffix('b').unwrap_or(&suffix);
    let multiplier: u64 = match unit {
        "" => 1,
        "k" => 1 << 10,
        "m" => 1 << 20,
        "g" => 1 << 30,
        "t" => 1 << 40,
        _ => return Err(format!("unknown size suffix in '{}'", value)),
    };

    Ok((number * multiplier as f64) as u64)
}

/// Parse a duration such as `30`, `1.5m`, `2h`, `1d` or `1w`
pub fn parse_duration(value: &str) -> Result<Duration, String> {
    let (number, suffix) = split_suffix(value);
    let number: f64 = number
        .parse()
        .map_err(|_| format!("'{}' is not a duration", value))?;

    let seconds = match suffix.to_ascii_lowercase().as_str() {
        "" | "s" => 1.0,
        "m" => 60.0,
        "h" => 3_600.0,
        "d" => 86_400.0,
        "w" => 604_800.0,
        _ => return Err(format!("unknown duration suffix in '{}'", value)),
    };

    Ok(Duration::from_secs_f64(number * seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> OptionSchema {
        OptionSchema::new()
            .option(
                "fdelay",
                OptionKind::Duration,
                OptionValue::Duration(Duration::from_secs(60)),
                "minimum age",
            )
            .option("verbose", OptionKind::Bool, OptionValue::Bool(false), "log more")
            .optional("threshold", OptionKind::Size, "size limit")
    }

    fn table(src: &str) -> Table {
        toml::from_str(src).unwrap()
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("512").unwrap(), 512);
        assert_eq!(parse_size("10k").unwrap(), 10 * 1024);
        assert_eq!(parse_size("1M").unwrap(), 1_048_576);
        assert_eq!(parse_size("2Gb").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_size("1.5K").unwrap(), 1536);
        assert!(parse_size("ten").is_err());
        assert!(parse_size("5q").is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("1.5m").unwrap(), Duration::from_secs(90));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("1w").unwrap(), Duration::from_secs(604_800));
        assert!(parse_duration("soon").is_err());
    }

    #[test]
    fn test_defaults_then_flow_defaults_then_overrides() {
        let defaults = table("fdelay = 120\nunrelated = \"x\"");
        let overrides = table("fdelay = \"30s\"\nthreshold = \"1M\"");

        let plain = schema().resolve("msg.fdelay", &Table::new(), None).unwrap();
        assert_eq!(plain.duration("fdelay").unwrap(), Duration::from_secs(60));
        assert!(!plain.is_set("threshold"));

        let flow = schema().resolve("msg.fdelay", &defaults, None).unwrap();
        assert_eq!(flow.duration("fdelay").unwrap(), Duration::from_secs(120));

        let scoped = schema()
            .resolve("msg.fdelay", &defaults, Some(&overrides))
            .unwrap();
        assert_eq!(scoped.duration("fdelay").unwrap(), Duration::from_secs(30));
        assert_eq!(scoped.size("threshold").unwrap(), 1_048_576);
        assert_eq!(scoped.stage(), "msg.fdelay");
    }

    #[test]
    fn test_resolution_does_not_touch_defaults() {
        let defaults = table("fdelay = 120");
        let overrides = table("fdelay = 5");

        let mut first = schema()
            .resolve("a.stage", &defaults, Some(&overrides))
            .unwrap();
        first.set("fdelay", OptionValue::Duration(Duration::from_secs(1)));

        let second = schema().resolve("b.stage", &defaults, None).unwrap();
        assert_eq!(second.duration("fdelay").unwrap(), Duration::from_secs(120));
        assert_eq!(defaults.get("fdelay"), Some(&Value::Integer(120)));
    }

    #[test]
    fn test_unknown_override_rejected() {
        let overrides = table("fdelya = 5");
        let err = schema()
            .resolve("msg.fdelay", &Table::new(), Some(&overrides))
            .unwrap_err();
        assert!(matches!(err, OptionError::Unknown { ref option, .. } if option == "fdelya"));
    }

    #[test]
    fn test_missing_required() {
        let schema = OptionSchema::new().required("post_dir", OptionKind::Str, "output");
        let err = schema.resolve("post.spool", &Table::new(), None).unwrap_err();
        assert_eq!(
            err,
            OptionError::Missing {
                stage: "post.spool".into(),
                option: "post_dir".into()
            }
        );
    }

    #[test]
    fn test_type_checks() {
        let overrides = table("verbose = \"maybe\"");
        assert!(matches!(
            schema().resolve("s", &Table::new(), Some(&overrides)),
            Err(OptionError::Invalid { .. })
        ));

        let overrides = table("verbose = \"on\"");
        let options = schema().resolve("s", &Table::new(), Some(&overrides)).unwrap();
        assert!(options.flag("verbose").unwrap());
        assert!(matches!(
            options.size("verbose"),
            Err(OptionError::WrongType { .. })
        ));
    }

    #[test]
    fn test_list_from_string() {
        let schema = OptionSchema::new().option(
            "schemes",
            OptionKind::List,
            OptionValue::List(vec![]),
            "schemes",
        );
        let overrides = table("schemes = \"download, downloads\"");
        let options = schema.resolve("s", &Table::new(), Some(&overrides)).unwrap();
        assert_eq!(options.list("schemes").unwrap(), ["download", "downloads"]);
    }
}
