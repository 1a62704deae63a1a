//! A small in-memory labeled array model for OOI stream data.
//!
//! Variables are flat, row-major buffers with named dimensions; a [`Dataset`]
//! keeps coordinates apart from data variables and checks that every
//! variable agrees with the shared dimension sizes.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};

use crate::error::{Error, Result};
use crate::time::{offset_to_date, parse_timestamp};

#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    Float(Vec<f64>),
    Time(Vec<DateTime<Utc>>),
    Text(Vec<String>),
}

impl Values {
    pub fn len(&self) -> usize {
        match self {
            Values::Float(v) => v.len(),
            Values::Time(v) => v.len(),
            Values::Text(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> &'static str {
        match self {
            Values::Float(_) => "float",
            Values::Time(_) => "time",
            Values::Text(_) => "text",
        }
    }

    fn extend(&mut self, other: &Values) -> Result<()> {
        match (self, other) {
            (Values::Float(a), Values::Float(b)) => a.extend_from_slice(b),
            (Values::Time(a), Values::Time(b)) => a.extend_from_slice(b),
            (Values::Text(a), Values::Text(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(Error::InvalidRequest(format!(
                    "cannot concatenate {} values with {} values",
                    a.kind(),
                    b.kind()
                )));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub dims: Vec<String>,
    pub values: Values,
    pub attrs: BTreeMap<String, String>,
}

impl Variable {
    pub fn new(dims: &[&str], values: Values) -> Self {
        Self {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            values,
            attrs: BTreeMap::new(),
        }
    }

    pub fn with_attr(mut self, key: &str, value: impl Into<String>) -> Self {
        self.attrs.insert(key.to_string(), value.into());
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    pub dims: BTreeMap<String, usize>,
    pub coords: BTreeMap<String, Variable>,
    pub data_vars: BTreeMap<String, Variable>,
    pub attrs: BTreeMap<String, String>,
}

impl Dataset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_coord(&mut self, name: &str, var: Variable) -> Result<()> {
        self.register_dims(name, &var)?;
        self.data_vars.remove(name);
        self.coords.insert(name.to_string(), var);
        Ok(())
    }

    pub fn add_var(&mut self, name: &str, var: Variable) -> Result<()> {
        self.register_dims(name, &var)?;
        self.coords.remove(name);
        self.data_vars.insert(name.to_string(), var);
        Ok(())
    }

    fn register_dims(&mut self, name: &str, var: &Variable) -> Result<()> {
        // sizes of dims not yet known are inferred only for 1-D variables
        let mut expected = 1usize;
        let mut unknown = Vec::new();
        for d in &var.dims {
            match self.dims.get(d) {
                Some(n) => expected *= n,
                None => unknown.push(d.clone()),
            }
        }
        match unknown.as_slice() {
            [] if expected == var.len() => {}
            [] => {
                return Err(Error::InvalidRequest(format!(
                    "variable `{}` has {} values but its dimensions hold {}",
                    name,
                    var.len(),
                    expected
                )));
            }
            [d] if expected > 0 && var.len() % expected == 0 => {
                self.dims.insert(d.clone(), var.len() / expected);
            }
            _ => {
                return Err(Error::InvalidRequest(format!(
                    "cannot infer dimension sizes of `{}`",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn len_of(&self, dim: &str) -> Option<usize> {
        self.dims.get(dim).copied()
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.data_vars.get(name).or_else(|| self.coords.get(name))
    }

    fn variables_mut(&mut self) -> impl Iterator<Item = &mut Variable> {
        self.coords.values_mut().chain(self.data_vars.values_mut())
    }

    /// Replaces dimension `old` by the 1-D variable `new` defined along it,
    /// which becomes the indexing coordinate.
    pub fn swap_dims(&mut self, old: &str, new: &str) -> Result<()> {
        let along_old = self
            .variable(new)
            .is_some_and(|v| v.dims.len() == 1 && v.dims[0] == old);
        if !along_old {
            return Err(Error::InvalidRequest(format!(
                "`{}` is not a 1-D variable along `{}`",
                new, old
            )));
        }
        let Some(size) = self.dims.remove(old) else {
            return Err(Error::InvalidRequest(format!("no dimension `{}`", old)));
        };
        self.dims.insert(new.to_string(), size);
        for var in self.variables_mut() {
            for d in var.dims.iter_mut() {
                if d == old {
                    *d = new.to_string();
                }
            }
        }
        if let Some(var) = self.data_vars.remove(new) {
            self.coords.insert(new.to_string(), var);
        }
        Ok(())
    }

    /// Decodes numeric variables whose `units` read `<unit> since <epoch>`
    /// into timestamps. Returns the names that were decoded.
    pub fn decode_times(&mut self) -> Vec<String> {
        let mut decoded = Vec::new();
        for (name, var) in self.coords.iter_mut().chain(self.data_vars.iter_mut()) {
            let Some((unit_secs, epoch)) = var.attrs.get("units").and_then(|u| parse_time_units(u)) else {
                continue;
            };
            let Values::Float(raw) = &var.values else {
                continue;
            };
            let times: Option<Vec<DateTime<Utc>>> = raw
                .iter()
                .map(|v| offset_to_date(*v, unit_secs, epoch.timestamp()))
                .collect();
            if let Some(times) = times {
                if let Some(units) = var.attrs.remove("units") {
                    var.attrs.insert("encoded_units".into(), units);
                }
                var.values = Values::Time(times);
                decoded.push(name.clone());
            }
        }
        decoded
    }

    /// Concatenates datasets along `dim`. Variables along `dim` must be 1-D;
    /// everything else is taken from the first dataset.
    pub fn concat(parts: Vec<Dataset>, dim: &str) -> Result<Dataset> {
        let mut iter = parts.into_iter();
        let Some(mut out) = iter.next() else {
            return Ok(Dataset::new());
        };
        for part in iter {
            let added = part.len_of(dim).unwrap_or(0);
            for (name, var) in part.coords.iter().chain(part.data_vars.iter()) {
                if !var.dims.iter().any(|d| d == dim) {
                    continue;
                }
                if var.dims.len() != 1 {
                    return Err(Error::InvalidRequest(format!(
                        "cannot concatenate multi-dimensional `{}` along `{}`",
                        name, dim
                    )));
                }
                let target = out
                    .coords
                    .get_mut(name)
                    .or_else(|| out.data_vars.get_mut(name))
                    .ok_or_else(|| {
                        Error::InvalidRequest(format!("`{}` missing from first dataset", name))
                    })?;
                target.values.extend(&var.values)?;
            }
            *out.dims.entry(dim.to_string()).or_insert(0) += added;
        }

        let size = out.len_of(dim).unwrap_or(0);
        for (name, var) in out.coords.iter().chain(out.data_vars.iter()) {
            if var.dims.len() == 1 && var.dims[0] == dim && var.len() != size {
                return Err(Error::InvalidRequest(format!(
                    "`{}` has {} values along `{}` after concatenation, expected {}",
                    name,
                    var.len(),
                    dim,
                    size
                )));
            }
        }
        Ok(out)
    }

    /// Builds a dataset along `dim` from JSON export rows. Numeric fields
    /// become float variables (missing as NaN), everything else text.
    pub fn from_records(records: &[serde_json::Value], dim: &str) -> Result<Dataset> {
        let keys: BTreeSet<&str> = records
            .iter()
            .filter_map(|r| r.as_object())
            .flat_map(|o| o.keys().map(String::as_str))
            .collect();

        let mut ds = Dataset::new();
        ds.dims.insert(dim.to_string(), records.len());
        for key in keys {
            let numeric = records.iter().all(|r| match r.get(key) {
                None | Some(serde_json::Value::Null) => true,
                Some(v) => v.is_number(),
            });
            let values = if numeric {
                Values::Float(
                    records
                        .iter()
                        .map(|r| r.get(key).and_then(|v| v.as_f64()).unwrap_or(f64::NAN))
                        .collect(),
                )
            } else {
                Values::Text(
                    records
                        .iter()
                        .map(|r| match r.get(key) {
                            Some(serde_json::Value::String(s)) => s.clone(),
                            Some(serde_json::Value::Null) | None => String::new(),
                            Some(other) => other.to_string(),
                        })
                        .collect(),
                )
            };
            ds.add_var(key, Variable::new(&[dim], values))?;
        }
        Ok(ds)
    }
}

/// Parses CF-style `"<unit> since <epoch>"` into (seconds per unit, epoch).
fn parse_time_units(units: &str) -> Option<(f64, DateTime<Utc>)> {
    let (unit, epoch) = units.split_once(" since ")?;
    let unit_secs = match unit.trim().to_ascii_lowercase().as_str() {
        "days" | "day" | "d" => 86_400.0,
        "hours" | "hour" | "h" => 3_600.0,
        "minutes" | "minute" | "min" => 60.0,
        "seconds" | "second" | "s" | "sec" => 1.0,
        "milliseconds" | "millisecond" | "ms" => 1e-3,
        "microseconds" | "microsecond" | "us" => 1e-6,
        _ => return None,
    };
    let epoch = epoch.trim();
    let epoch = parse_timestamp(epoch).ok().or_else(|| {
        // e.g. "1900-01-01 0:0:0"
        epoch
            .split([' ', 'T'])
            .next()
            .and_then(|d| parse_timestamp(d).ok())
    })?;
    Some((unit_secs, epoch))
}
