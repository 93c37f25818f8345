//! Model parameters shared by identity
//!
//! A [`Parameter`] is a cheap handle to shared state. Cloning the handle does
//! not copy the parameter: every clone observes the same value, bounds and
//! frozen flag. This is how one spectral index can be shared by the models of
//! two datasets in a joint fit and still be optimized once.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Plain-data view of a parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterState {
    /// Parameter name
    pub name: String,
    /// Current value (physical units)
    pub value: f64,
    /// Unit string, empty for dimensionless
    #[serde(default)]
    pub unit: String,
    /// Scale used by the optimizer: `value = factor * scale`
    #[serde(default = "one")]
    pub scale: f64,
    /// Lower bound (physical units), `-inf` if unbounded; stored as `null`
    #[serde(default = "neg_inf", serialize_with = "bound::serialize")]
    #[serde(deserialize_with = "bound::lower")]
    pub min: f64,
    /// Upper bound (physical units), `+inf` if unbounded; stored as `null`
    #[serde(default = "pos_inf", serialize_with = "bound::serialize")]
    #[serde(deserialize_with = "bound::upper")]
    pub max: f64,
    /// Excluded from the optimization vector when set
    #[serde(default)]
    pub frozen: bool,
    /// 1-sigma uncertainty from the last covariance estimate
    #[serde(default)]
    pub error: f64,
}

fn one() -> f64 {
    1.0
}

fn neg_inf() -> f64 {
    f64::NEG_INFINITY
}

fn pos_inf() -> f64 {
    f64::INFINITY
}

/// Infinite bounds as `null`, since JSON has no infinity
mod bound {
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S: Serializer>(v: &f64, s: S) -> Result<S::Ok, S::Error> {
        if v.is_finite() { s.serialize_some(v) } else { s.serialize_none() }
    }

    pub(super) fn lower<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::NEG_INFINITY))
    }

    pub(super) fn upper<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(d)?.unwrap_or(f64::INFINITY))
    }
}

/// Shared handle to a model parameter
#[derive(Clone)]
pub struct Parameter(Arc<RwLock<ParameterState>>);

impl Parameter {
    /// Create an unbounded, free, dimensionless parameter
    pub fn new(name: impl Into<String>, value: f64) -> Self {
        Self::from_state(ParameterState {
            name: name.into(),
            value,
            unit: String::new(),
            scale: 1.0,
            min: f64::NEG_INFINITY,
            max: f64::INFINITY,
            frozen: false,
            error: 0.0,
        })
    }

    /// Wrap a plain state into a new, independent handle
    pub fn from_state(state: ParameterState) -> Self {
        Self(Arc::new(RwLock::new(state)))
    }

    /// Builder: set the unit
    pub fn with_unit(self, unit: impl Into<String>) -> Self {
        self.write().unit = unit.into();
        self
    }

    /// Builder: set both bounds
    pub fn with_bounds(self, min: f64, max: f64) -> Self {
        {
            let mut s = self.write();
            s.min = min;
            s.max = max;
        }
        self
    }

    /// Builder: set the frozen flag
    pub fn with_frozen(self, frozen: bool) -> Self {
        self.write().frozen = frozen;
        self
    }

    /// Builder: set the optimizer scale
    pub fn with_scale(self, scale: f64) -> Self {
        self.write().scale = scale;
        self
    }

    fn read(&self) -> RwLockReadGuard<'_, ParameterState> {
        self.0.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, ParameterState> {
        self.0.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the current state
    pub fn state(&self) -> ParameterState {
        self.read().clone()
    }

    /// Parameter name
    pub fn name(&self) -> String {
        self.read().name.clone()
    }

    /// Unit string
    pub fn unit(&self) -> String {
        self.read().unit.clone()
    }

    /// Current value
    pub fn value(&self) -> f64 {
        self.read().value
    }

    /// Set the value (bounds are not enforced here; the optimizer clamps)
    pub fn set_value(&self, value: f64) {
        self.write().value = value;
    }

    /// Optimizer scale
    pub fn scale(&self) -> f64 {
        self.read().scale
    }

    /// Value divided by scale
    pub fn factor(&self) -> f64 {
        let s = self.read();
        s.value / s.scale
    }

    /// Set the value through its factor
    pub fn set_factor(&self, factor: f64) {
        let mut s = self.write();
        s.value = factor * s.scale;
    }

    /// Lower bound
    pub fn min(&self) -> f64 {
        self.read().min
    }

    /// Upper bound
    pub fn max(&self) -> f64 {
        self.read().max
    }

    /// Set both bounds, rejecting `min > max`
    pub fn set_bounds(&self, min: f64, max: f64) -> Result<()> {
        if min > max {
            return Err(Error::Validation(format!(
                "parameter '{}': min {} > max {}",
                self.name(),
                min,
                max
            )));
        }
        let mut s = self.write();
        s.min = min;
        s.max = max;
        Ok(())
    }

    /// Bounds expressed in factor space
    pub fn factor_bounds(&self) -> (f64, f64) {
        let s = self.read();
        let (a, b) = (s.min / s.scale, s.max / s.scale);
        if s.scale < 0.0 { (b, a) } else { (a, b) }
    }

    /// Frozen flag
    pub fn is_frozen(&self) -> bool {
        self.read().frozen
    }

    /// Freeze or thaw
    pub fn set_frozen(&self, frozen: bool) {
        self.write().frozen = frozen;
    }

    /// 1-sigma error from the last covariance estimate
    pub fn error(&self) -> f64 {
        self.read().error
    }

    /// Store a 1-sigma error
    pub fn set_error(&self, error: f64) {
        self.write().error = error;
    }

    /// Choose a power-of-ten scale so that the factor is of order one
    pub fn autoscale(&self) {
        let mut s = self.write();
        let v = s.value.abs();
        if v.is_finite() && v > 0.0 {
            let power = v.log10().floor();
            s.scale = 10f64.powf(power);
        } else {
            s.scale = 1.0;
        }
    }

    /// `true` if both handles point at the same parameter
    pub fn ptr_eq(&self, other: &Parameter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    /// Identity key, stable for the lifetime of the parameter
    pub fn id(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// A new, independent parameter with the same state
    pub fn deep_copy(&self) -> Parameter {
        Parameter::from_state(self.state())
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.read();
        f.debug_struct("Parameter")
            .field("name", &s.name)
            .field("value", &s.value)
            .field("unit", &s.unit)
            .field("min", &s.min)
            .field("max", &s.max)
            .field("frozen", &s.frozen)
            .finish()
    }
}

/// Ordered collection of parameters without duplicates (by identity)
#[derive(Debug, Clone, Default)]
pub struct Parameters {
    items: Vec<Parameter>,
}

impl Parameters {
    /// Build from handles, dropping repeated handles
    pub fn new(items: Vec<Parameter>) -> Self {
        let mut out = Self::default();
        for p in items {
            out.push(p);
        }
        out
    }

    /// Append a handle unless it is already present
    pub fn push(&mut self, p: Parameter) {
        if !self.contains(&p) {
            self.items.push(p);
        }
    }

    /// Append all handles of `other` not yet present
    pub fn extend(&mut self, other: &Parameters) {
        for p in other.iter() {
            self.push(p.clone());
        }
    }

    /// Number of parameters
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// `true` if empty
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Iterate handles
    pub fn iter(&self) -> impl Iterator<Item = &Parameter> {
        self.items.iter()
    }

    /// Membership by identity
    pub fn contains(&self, p: &Parameter) -> bool {
        self.items.iter().any(|q| q.ptr_eq(p))
    }

    /// Position of a handle
    pub fn index_of(&self, p: &Parameter) -> Option<usize> {
        self.items.iter().position(|q| q.ptr_eq(p))
    }

    /// First parameter with the given name
    pub fn get(&self, name: &str) -> Option<&Parameter> {
        self.items.iter().find(|p| p.name() == name)
    }

    /// Parameter by position
    pub fn at(&self, i: usize) -> Option<&Parameter> {
        self.items.get(i)
    }

    /// Non-frozen parameters
    pub fn free(&self) -> Parameters {
        Parameters { items: self.items.iter().filter(|p| !p.is_frozen()).cloned().collect() }
    }

    /// Names in order
    pub fn names(&self) -> Vec<String> {
        self.items.iter().map(Parameter::name).collect()
    }

    /// Values in order
    pub fn values(&self) -> Vec<f64> {
        self.items.iter().map(Parameter::value).collect()
    }

    /// Set all values; length must match
    pub fn set_values(&self, values: &[f64]) -> Result<()> {
        self.check_len(values.len())?;
        for (p, &v) in self.items.iter().zip(values) {
            p.set_value(v);
        }
        Ok(())
    }

    /// Factors in order
    pub fn factors(&self) -> Vec<f64> {
        self.items.iter().map(Parameter::factor).collect()
    }

    /// Set all factors; length must match
    pub fn set_factors(&self, factors: &[f64]) -> Result<()> {
        self.check_len(factors.len())?;
        for (p, &f) in self.items.iter().zip(factors) {
            p.set_factor(f);
        }
        Ok(())
    }

    /// Bounds in factor space
    pub fn factor_bounds(&self) -> Vec<(f64, f64)> {
        self.items.iter().map(Parameter::factor_bounds).collect()
    }

    /// Scales in order
    pub fn scales(&self) -> Vec<f64> {
        self.items.iter().map(Parameter::scale).collect()
    }

    /// Autoscale every parameter
    pub fn autoscale(&self) {
        for p in &self.items {
            p.autoscale();
        }
    }

    /// Snapshot of all states
    pub fn states(&self) -> Vec<ParameterState> {
        self.items.iter().map(Parameter::state).collect()
    }

    /// Restore values saved by [`Parameters::states`]
    pub fn restore(&self, states: &[ParameterState]) -> Result<()> {
        self.check_len(states.len())?;
        for (p, s) in self.items.iter().zip(states) {
            p.set_value(s.value);
            p.set_frozen(s.frozen);
        }
        Ok(())
    }

    fn check_len(&self, got: usize) -> Result<()> {
        if got != self.items.len() {
            return Err(Error::Validation(format!(
                "Parameter length mismatch: expected {}, got {}",
                self.items.len(),
                got
            )));
        }
        Ok(())
    }
}

impl FromIterator<Parameter> for Parameters {
    fn from_iter<I: IntoIterator<Item = Parameter>>(iter: I) -> Self {
        Parameters::new(iter.into_iter().collect())
    }
}

/// Covariance matrix keyed by parameter identity
///
/// Entries for parameters not part of a fit are zero. Sub-blocks estimated by
/// separate fits are merged with [`Covariance::set_subcovariance`].
#[derive(Debug, Clone, Default)]
pub struct Covariance {
    parameters: Parameters,
    /// Row-major `n × n`
    data: Vec<f64>,
}

impl Covariance {
    /// Zero covariance over the given parameters
    pub fn zeros(parameters: Parameters) -> Self {
        let n = parameters.len();
        Self { parameters, data: vec![0.0; n * n] }
    }

    /// Covariance from a row-major matrix
    pub fn from_row_major(parameters: Parameters, data: Vec<f64>) -> Result<Self> {
        let n = parameters.len();
        if data.len() != n * n {
            return Err(Error::Validation(format!(
                "covariance size {} does not match {} parameters",
                data.len(),
                n
            )));
        }
        Ok(Self { parameters, data })
    }

    /// Parameters spanning the matrix
    pub fn parameters(&self) -> &Parameters {
        &self.parameters
    }

    /// Row-major matrix
    pub fn data(&self) -> &[f64] {
        &self.data
    }

    /// Entry for a pair of parameters, `None` if either is not covered
    pub fn get(&self, a: &Parameter, b: &Parameter) -> Option<f64> {
        let i = self.parameters.index_of(a)?;
        let j = self.parameters.index_of(b)?;
        Some(self.data[i * self.parameters.len() + j])
    }

    /// 1-sigma error of a parameter
    pub fn error(&self, p: &Parameter) -> Option<f64> {
        self.get(p, p).map(|v| v.max(0.0).sqrt())
    }

    /// Copy the entries of `sub` into this matrix where both parameters are covered
    pub fn set_subcovariance(&mut self, sub: &Covariance) {
        let n = self.parameters.len();
        let m = sub.parameters.len();
        let map: Vec<Option<usize>> =
            sub.parameters.iter().map(|p| self.parameters.index_of(p)).collect();
        for a in 0..m {
            for b in 0..m {
                if let (Some(i), Some(j)) = (map[a], map[b]) {
                    self.data[i * n + j] = sub.data[a * m + b];
                }
            }
        }
    }

    /// Write the diagonal errors back into the parameters
    pub fn apply_errors(&self) {
        for p in self.parameters.iter() {
            if let Some(e) = self.error(p) {
                p.set_error(e);
            }
        }
    }
}
