use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};

use crate::Error;

// Modbus limits sequential reads to 125 registers - https://github.com/slowtec/tokio-modbus/issues/112#issuecomment-1095316069=
pub const MAX_GROUP_SIZE: u16 = 125;

/// Polling cadence bucket.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PollSpeed {
    Once,
    Fast,
    #[default]
    Normal,
    Slow,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegisterKind {
    #[default]
    Input,
    #[serde(alias = "hold")]
    Holding,
}

/// Numeric code to display string.
#[derive(Clone, Debug)]
pub enum ValueMap {
    Table(BTreeMap<i64, String>),
    Lookup(fn(i64) -> Option<String>),
}

#[derive(Clone, Debug)]
pub enum FieldKind {
    Numeric { scale: Decimal, signed: bool },
    String,
    Enum { map: ValueMap },
    Bit { bit: u8 },
}

/// One decoded value within a [`RegisterGroup`].
#[derive(Clone, Debug)]
pub struct Field {
    pub name: String,
    pub address: u16,
    /// Number of registers the value spans
    pub width: u8,
    pub kind: FieldKind,
    pub unit: Option<String>,
    pub min: Option<Decimal>,
    pub max: Option<Decimal>,
}

impl Field {
    pub fn numeric<N: Into<String>>(
        name: N,
        address: u16,
        width: u8,
        scale: Decimal,
        signed: bool,
    ) -> Self {
        let kind = if scale.is_zero() && width > 1 {
            // A zero scale across several registers is how string registers are described.
            FieldKind::String
        } else {
            FieldKind::Numeric { scale, signed }
        };
        Self::new(name, address, width, kind)
    }

    pub fn string<N: Into<String>>(name: N, address: u16, width: u8) -> Self {
        Self::new(name, address, width, FieldKind::String)
    }

    pub fn mapped<N: Into<String>>(name: N, address: u16, map: ValueMap) -> Self {
        Self::new(name, address, 1, FieldKind::Enum { map })
    }

    pub fn bit<N: Into<String>>(name: N, address: u16, bit: u8) -> Self {
        Self::new(name, address, 1, FieldKind::Bit { bit })
    }

    fn new<N: Into<String>>(name: N, address: u16, width: u8, kind: FieldKind) -> Self {
        Self {
            name: name.into(),
            address,
            width,
            kind,
            unit: None,
            min: None,
            max: None,
        }
    }

    pub fn with_unit<U: Into<String>>(mut self, unit: U) -> Self {
        self.unit = Some(unit.into());
        self
    }

    pub fn with_bounds(mut self, min: Option<Decimal>, max: Option<Decimal>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    /// Registers occupied by this field.
    pub fn span(&self) -> std::ops::Range<u32> {
        self.address as u32..self.address as u32 + self.width as u32
    }

    fn validate(&self) -> crate::Result<()> {
        let invalid = |reason: &str| Err(Error::InvalidGroup(format!("{}: {reason}", self.name)));
        match self.kind {
            _ if self.width == 0 => invalid("width must be at least 1"),
            FieldKind::Numeric { .. } if self.width > 2 => invalid("numbers span 1 or 2 registers"),
            FieldKind::Bit { bit } if bit > 15 => invalid("bit position must be 0-15"),
            FieldKind::Bit { .. } | FieldKind::Enum { .. } if self.width != 1 => {
                invalid("bit and enum fields span exactly 1 register")
            }
            _ => Ok(()),
        }
    }

    /// Fills in unit-derived bounds for whichever side was not given explicitly. Only plain
    /// numbers are bounds-checked.
    fn resolve_bounds(&mut self) {
        if !matches!(self.kind, FieldKind::Numeric { .. }) {
            self.min = None;
            self.max = None;
            return;
        }
        if let Some((min, max)) = self.unit.as_deref().and_then(default_bounds) {
            self.min = self.min.or(Some(min));
            self.max = self.max.or(Some(max));
        }
    }
}

/// Operating ranges assumed for common units when a field does not declare its own.
pub fn default_bounds(unit: &str) -> Option<(Decimal, Decimal)> {
    let (min, max) = match unit {
        "%" => (0, 100),
        "°C" => (-40, 100),
        "V" => (0, 1000),
        "A" => (-100, 100),
        "W" => (-50_000, 50_000),
        "kW" => (-50, 50),
        "kWh" => (0, 1_000_000),
        "Hz" => (45, 65),
        _ => return None,
    };
    Some((Decimal::from(min), Decimal::from(max)))
}

/// A contiguous block of registers read in one request, with the fields decoded from it.
///
/// Groups are validated when built and are immutable afterwards.
#[derive(Clone, Debug, Deserialize)]
#[serde(try_from = "GroupDefinition")]
pub struct RegisterGroup {
    start: u16,
    count: u16,
    speed: PollSpeed,
    kind: RegisterKind,
    cache_ttl: Option<Duration>,
    fields: Vec<Field>,
}

impl RegisterGroup {
    pub fn new(
        start: u16,
        count: u16,
        speed: PollSpeed,
        kind: RegisterKind,
        cache_ttl: Option<Duration>,
        mut fields: Vec<Field>,
    ) -> crate::Result<Self> {
        if count == 0 || count > MAX_GROUP_SIZE {
            return Err(Error::InvalidGroup(format!(
                "group at {start} must hold 1-{MAX_GROUP_SIZE} registers, not {count}"
            )));
        }
        let range = start as u32..start as u32 + count as u32;

        for field in fields.iter_mut() {
            field.validate()?;
            let span = field.span();
            if span.start < range.start || span.end > range.end {
                return Err(Error::InvalidGroup(format!(
                    "{} ({}..{}) lies outside group {}..{}",
                    field.name, span.start, span.end, range.start, range.end
                )));
            }
            field.resolve_bounds();
        }

        Ok(Self {
            start,
            count,
            speed,
            kind,
            cache_ttl,
            fields,
        })
    }

    pub fn start(&self) -> u16 {
        self.start
    }

    pub fn count(&self) -> u16 {
        self.count
    }

    pub fn speed(&self) -> PollSpeed {
        self.speed
    }

    pub fn kind(&self) -> RegisterKind {
        self.kind
    }

    pub fn is_holding(&self) -> bool {
        self.kind == RegisterKind::Holding
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Words belonging to `field`, given the words read for the whole group.
    pub fn words_for<'a>(&self, field: &Field, words: &'a [u16]) -> Option<&'a [u16]> {
        let offset = field.address.checked_sub(self.start)? as usize;
        words.get(offset..offset + field.width as usize)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "lowercase")]
enum FieldType {
    Numeric,
    String,
    Enum,
    Bit,
}

#[derive(Deserialize)]
struct FieldDefinition {
    #[serde(default)]
    name: Option<String>,
    address: u16,
    #[serde(alias = "count", default = "default_width")]
    width: u8,
    #[serde(rename = "type", default)]
    of: Option<FieldType>,
    #[serde(alias = "multiplier", default = "default_scale")]
    scale: Decimal,
    #[serde(default)]
    signed: bool,
    #[serde(default)]
    map: Option<BTreeMap<i64, String>>,
    #[serde(default)]
    bit: Option<u8>,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    min: Option<Decimal>,
    #[serde(default)]
    max: Option<Decimal>,
}

fn default_width() -> u8 {
    1
}

fn default_scale() -> Decimal {
    Decimal::ONE
}

impl TryFrom<FieldDefinition> for Field {
    type Error = Error;

    fn try_from(def: FieldDefinition) -> crate::Result<Self> {
        let name = def.name.unwrap_or_else(|| def.address.to_string());
        let field = match (def.of, def.map, def.bit) {
            (Some(FieldType::String), _, _) => Field::string(name, def.address, def.width),
            (Some(FieldType::Enum) | None, Some(map), _) => {
                Field::mapped(name, def.address, ValueMap::Table(map))
            }
            (Some(FieldType::Enum), None, _) => {
                return Err(Error::InvalidGroup(format!("{name}: enum field needs a map")))
            }
            (Some(FieldType::Bit) | None, _, Some(bit)) => Field::bit(name, def.address, bit),
            (Some(FieldType::Bit), _, None) => {
                return Err(Error::InvalidGroup(format!("{name}: bit field needs a bit")))
            }
            (Some(FieldType::Numeric) | None, _, _) => {
                Field::numeric(name, def.address, def.width, def.scale, def.signed)
            }
        };
        let field = field.with_bounds(def.min, def.max);
        Ok(match def.unit {
            Some(unit) => field.with_unit(unit),
            None => field,
        })
    }
}

#[derive(Deserialize)]
struct GroupDefinition {
    #[serde(alias = "register_start")]
    start: u16,
    count: u16,
    #[serde(alias = "poll_speed", default)]
    speed: PollSpeed,
    #[serde(rename = "register_type", alias = "kind", default)]
    kind: RegisterKind,
    #[serde(with = "humantime_serde", default)]
    cache_ttl: Option<Duration>,
    #[serde(default)]
    fields: Vec<FieldDefinition>,
}

impl TryFrom<GroupDefinition> for RegisterGroup {
    type Error = Error;

    fn try_from(def: GroupDefinition) -> crate::Result<Self> {
        let fields = def
            .fields
            .into_iter()
            .map(Field::try_from)
            .collect::<crate::Result<Vec<_>>>()?;
        RegisterGroup::new(
            def.start,
            def.count,
            def.speed,
            def.kind,
            def.cache_ttl,
            fields,
        )
    }
}

#[cfg(test)]
use pretty_assertions::assert_eq;

#[test]
fn parse_group_defaults() {
    use serde_json::json;
    let group = serde_json::from_value::<RegisterGroup>(json!({
        "start": 5000,
        "count": 2,
        "fields": [
            { "address": 5000 },
        ]
    }))
    .unwrap();

    assert_eq!(group.speed(), PollSpeed::Normal);
    assert_eq!(group.kind(), RegisterKind::Input);
    assert_eq!(group.cache_ttl(), None);
    let field = &group.fields()[0];
    assert_eq!(field.name, "5000");
    assert_eq!(field.width, 1);
    assert!(matches!(
        field.kind,
        FieldKind::Numeric { scale, signed: false } if scale == Decimal::ONE
    ));
}

#[test]
fn parse_group_with_every_field_kind() {
    use serde_json::json;
    let group = serde_json::from_value::<RegisterGroup>(json!({
        "start": 13000,
        "count": 30,
        "speed": "fast",
        "register_type": "holding",
        "cache_ttl": "10s",
        "fields": [
            { "name": "state", "address": 13000, "map": { "0": "Stop", "64": "Running" } },
            { "name": "serial", "address": 13001, "type": "string", "width": 10 },
            { "name": "model", "address": 13011, "width": 2, "scale": 0 },
            { "name": "limited", "address": 13013, "bit": 4 },
            { "name": "power", "address": 13014, "width": 2, "scale": 1, "signed": true, "unit": "W" },
            { "name": "soc", "address": 13016, "scale": 0.1, "unit": "%", "min": 5 },
        ]
    }))
    .unwrap();

    assert_eq!(group.speed(), PollSpeed::Fast);
    assert!(group.is_holding());
    assert_eq!(group.cache_ttl(), Some(Duration::from_secs(10)));

    let fields = group.fields();
    assert!(matches!(fields[0].kind, FieldKind::Enum { .. }));
    assert!(matches!(fields[1].kind, FieldKind::String));
    assert!(matches!(fields[2].kind, FieldKind::String));
    assert!(matches!(fields[3].kind, FieldKind::Bit { bit: 4 }));
    assert_eq!(fields[4].min, Some(Decimal::from(-50_000)));
    assert_eq!(fields[4].max, Some(Decimal::from(50_000)));
    // explicit minimum wins, maximum still comes from the unit
    assert_eq!(fields[5].min, Some(Decimal::from(5)));
    assert_eq!(fields[5].max, Some(Decimal::from(100)));
}

#[test]
fn mapped_fields_have_no_bounds() {
    let field = Field::mapped("state", 1, ValueMap::Table(BTreeMap::new()))
        .with_unit("%")
        .with_bounds(Some(Decimal::ZERO), Some(Decimal::TEN));
    let group = RegisterGroup::new(1, 1, PollSpeed::Fast, RegisterKind::Input, None, vec![field])
        .unwrap();
    assert_eq!(group.fields()[0].min, None);
    assert_eq!(group.fields()[0].max, None);
}

#[test]
fn unknown_units_have_no_default_bounds() {
    assert_eq!(default_bounds("furlongs"), None);
    assert_eq!(
        default_bounds("Hz"),
        Some((Decimal::from(45), Decimal::from(65)))
    );
}

#[test]
fn reject_fields_outside_the_group() {
    let result = RegisterGroup::new(
        5000,
        2,
        PollSpeed::Fast,
        RegisterKind::Input,
        None,
        vec![Field::numeric("total", 5001, 2, Decimal::ONE, false)],
    );
    assert!(matches!(result, Err(Error::InvalidGroup(_))));
}

#[test]
fn reject_invalid_group_sizes_and_fields() {
    for count in [0, MAX_GROUP_SIZE + 1] {
        let result = RegisterGroup::new(0, count, PollSpeed::Slow, RegisterKind::Input, None, vec![]);
        assert!(matches!(result, Err(Error::InvalidGroup(_))));
    }

    let wide = Field::numeric("wide", 0, 4, Decimal::ONE, false);
    let result = RegisterGroup::new(0, 4, PollSpeed::Slow, RegisterKind::Input, None, vec![wide]);
    assert!(matches!(result, Err(Error::InvalidGroup(_))));

    let result = serde_json::from_value::<RegisterGroup>(serde_json::json!({
        "start": 0, "count": 1, "fields": [{ "address": 0, "type": "bit" }]
    }));
    assert!(result.is_err());
}

#[test]
fn words_for_field() {
    let group = RegisterGroup::new(
        100,
        4,
        PollSpeed::Normal,
        RegisterKind::Input,
        None,
        vec![Field::numeric("pair", 102, 2, Decimal::ONE, false)],
    )
    .unwrap();
    let words = [1, 2, 3, 4];
    assert_eq!(group.words_for(&group.fields()[0], &words), Some(&words[2..4]));
    assert_eq!(group.words_for(&group.fields()[0], &words[..3]), None);
}
