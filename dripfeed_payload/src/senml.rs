//! SenML payload.
//!
//! Synthesizes single-record SenML packs, one reading per call. The record
//! name is the data source's resource URL and the value is drawn from a
//! configured distribution.

use std::io::Write;

use rand::Rng;

use crate::Error;

fn default_float_min() -> f64 {
    0.0
}

fn default_float_max() -> f64 {
    1.0
}

/// Distribution of synthesized sensor values
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
#[serde(deny_unknown_fields)]
pub enum ValueKind {
    /// Uniform floats in the half-open range `[min, max)`
    Float {
        /// Lower bound, inclusive
        #[serde(default = "default_float_min")]
        min: f64,
        /// Upper bound, exclusive
        #[serde(default = "default_float_max")]
        max: f64,
    },
    /// Fair coin flips
    Bool,
    /// Printable ASCII strings of up to `max_length` characters
    Ascii {
        /// Longest string to synthesize, must not be zero
        max_length: u16,
    },
}

impl Default for ValueKind {
    fn default() -> Self {
        Self::Float {
            min: default_float_min(),
            max: default_float_max(),
        }
    }
}

/// A single SenML record.
///
/// Field names follow the SenML JSON mapping. Only the subset of fields the
/// datastore accepts is modeled; unset fields are omitted from the encoding.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Record {
    /// Base name, prepended to `n` by consumers
    #[serde(rename = "bn", default, skip_serializing_if = "Option::is_none")]
    pub base_name: Option<String>,
    /// Base time in seconds
    #[serde(rename = "bt", default, skip_serializing_if = "Option::is_none")]
    pub base_time: Option<f64>,
    /// Base unit
    #[serde(rename = "bu", default, skip_serializing_if = "Option::is_none")]
    pub base_unit: Option<String>,
    /// Record name
    #[serde(rename = "n", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Unit of the value
    #[serde(rename = "u", default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    /// Time of the reading in seconds, absent means "now" to the datastore
    #[serde(rename = "t", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<f64>,
    /// Float value
    #[serde(rename = "v", default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,
    /// String value
    #[serde(rename = "vs", default, skip_serializing_if = "Option::is_none")]
    pub string_value: Option<String>,
    /// Boolean value
    #[serde(rename = "vb", default, skip_serializing_if = "Option::is_none")]
    pub bool_value: Option<bool>,
}

#[derive(Debug, Clone)]
/// SenML pack payload for one data source
pub struct SenMl {
    name: String,
    unit: Option<String>,
    kind: ValueKind,
}

impl SenMl {
    /// Construct a new instance of `SenMl`
    ///
    /// # Errors
    ///
    /// Function will return an error if a float distribution is configured
    /// with an empty range.
    pub fn new(name: String, unit: Option<String>, kind: ValueKind) -> Result<Self, Error> {
        if let ValueKind::Float { min, max } = kind
            && min >= max
        {
            return Err(Error::FloatBounds { min, max });
        }
        Ok(Self { name, unit, kind })
    }

    fn record<R>(&self, rng: &mut R) -> Record
    where
        R: Rng + ?Sized,
    {
        let mut record = Record {
            name: Some(self.name.clone()),
            unit: self.unit.clone(),
            ..Record::default()
        };
        match self.kind {
            ValueKind::Float { min, max } => {
                record.value = Some(rng.random_range(min..max));
            }
            ValueKind::Bool => {
                record.bool_value = Some(rng.random_bool(0.5));
            }
            ValueKind::Ascii { max_length } => {
                let length = rng.random_range(1..=usize::from(max_length.max(1)));
                let text: String = (0..length)
                    .map(|_| char::from(rng.random_range(0x20..0x7F_u8)))
                    .collect();
                record.string_value = Some(text);
            }
        }
        record
    }
}

impl crate::Serialize for SenMl {
    fn to_bytes<W, R>(&mut self, mut rng: R, max_bytes: usize, writer: &mut W) -> Result<(), Error>
    where
        R: Rng + Sized,
        W: Write,
    {
        let pack = vec![self.record(&mut rng)];
        let encoding = serde_json::to_vec(&pack)?;
        if encoding.len() > max_bytes {
            return Err(Error::ByteBudget {
                required: encoding.len(),
                budget: max_bytes,
            });
        }
        writer.write_all(&encoding)?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use rand::{SeedableRng, rngs::SmallRng};

    use crate::{Error, SenMl, Serialize, senml::Record, senml::ValueKind};

    // The serialized size of the payload must not exceed `max_bytes`.
    proptest! {
        #[test]
        fn payload_not_exceed_max_bytes(seed: u64, max_bytes in 128_u16..4096) {
            let max_bytes = max_bytes as usize;
            let mut rng = SmallRng::seed_from_u64(seed);
            let mut senml = SenMl::new(
                String::from("http://dummy/ds1"),
                None,
                ValueKind::default(),
            ).expect("default bounds are valid");

            let mut bytes = Vec::with_capacity(max_bytes);
            senml.to_bytes(&mut rng, max_bytes, &mut bytes)?;
            prop_assert!(bytes.len() <= max_bytes);
        }

        // Equal seeds must produce identical packs.
        #[test]
        fn payload_is_deterministic(seed: u64) {
            let mut left_rng = SmallRng::seed_from_u64(seed);
            let mut right_rng = SmallRng::seed_from_u64(seed);
            let mut left = SenMl::new(
                String::from("http://dummy/ds1"),
                Some(String::from("Cel")),
                ValueKind::default(),
            ).expect("default bounds are valid");
            let mut right = left.clone();

            let mut left_bytes = Vec::new();
            let mut right_bytes = Vec::new();
            left.to_bytes(&mut left_rng, 4096, &mut left_bytes)?;
            right.to_bytes(&mut right_rng, 4096, &mut right_bytes)?;
            prop_assert_eq!(left_bytes, right_bytes);
        }
    }

    #[test]
    fn pack_parses_with_expected_fields() {
        let mut rng = SmallRng::seed_from_u64(8675_309);
        let mut senml = SenMl::new(
            String::from("http://sensors/basement"),
            Some(String::from("Cel")),
            ValueKind::Float {
                min: 10.0,
                max: 20.0,
            },
        )
        .expect("bounds are valid");

        let mut bytes = Vec::new();
        senml
            .to_bytes(&mut rng, 4096, &mut bytes)
            .expect("payload fits budget");

        let pack: Vec<Record> = serde_json::from_slice(&bytes).expect("pack is valid JSON");
        assert_eq!(pack.len(), 1);
        let record = &pack[0];
        assert_eq!(record.name.as_deref(), Some("http://sensors/basement"));
        assert_eq!(record.unit.as_deref(), Some("Cel"));
        let value = record.value.expect("float record carries v");
        assert!((10.0..20.0).contains(&value));
        assert_eq!(record.string_value, None);
        assert_eq!(record.bool_value, None);
    }

    #[test]
    fn bool_kind_sets_vb_only() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut senml = SenMl::new(String::from("http://dummy/door"), None, ValueKind::Bool)
            .expect("bool kind is always valid");

        let mut bytes = Vec::new();
        senml
            .to_bytes(&mut rng, 4096, &mut bytes)
            .expect("payload fits budget");

        let pack: Vec<Record> = serde_json::from_slice(&bytes).expect("pack is valid JSON");
        assert!(pack[0].bool_value.is_some());
        assert_eq!(pack[0].value, None);
        assert_eq!(pack[0].string_value, None);
    }

    #[test]
    fn ascii_kind_respects_max_length() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut senml = SenMl::new(
            String::from("http://dummy/label"),
            None,
            ValueKind::Ascii { max_length: 16 },
        )
        .expect("ascii kind is always valid");

        let mut bytes = Vec::new();
        senml
            .to_bytes(&mut rng, 4096, &mut bytes)
            .expect("payload fits budget");

        let pack: Vec<Record> = serde_json::from_slice(&bytes).expect("pack is valid JSON");
        let text = pack[0].string_value.as_deref().expect("vs is set");
        assert!(!text.is_empty());
        assert!(text.len() <= 16);
        assert!(text.chars().all(|c| (' '..='~').contains(&c)));
    }

    #[test]
    fn unset_fields_are_omitted_from_encoding() {
        let record = Record {
            name: Some(String::from("x")),
            value: Some(1.0),
            ..Record::default()
        };
        let encoded = serde_json::to_string(&record).expect("record encodes");
        assert_eq!(encoded, r#"{"n":"x","v":1.0}"#);
    }

    #[test]
    fn empty_float_range_is_rejected() {
        let result = SenMl::new(
            String::from("http://dummy/ds1"),
            None,
            ValueKind::Float { min: 1.0, max: 1.0 },
        );
        assert!(matches!(result, Err(Error::FloatBounds { .. })));
    }

    #[test]
    fn over_budget_pack_writes_nothing() {
        let mut rng = SmallRng::seed_from_u64(42);
        let mut senml = SenMl::new(
            String::from("http://dummy/ds1"),
            None,
            ValueKind::default(),
        )
        .expect("default bounds are valid");

        let mut bytes = Vec::new();
        let result = senml.to_bytes(&mut rng, 4, &mut bytes);
        assert!(matches!(result, Err(Error::ByteBudget { .. })));
        assert!(bytes.is_empty());
    }
}
