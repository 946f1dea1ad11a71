use crate::SimError;

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParameterState {
    values: Vec<f64>,
}

impl ParameterState {
    pub fn new(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn parameter(&self, parameter_id: usize) -> Result<f64, SimError> {
        self.values.get(parameter_id).copied().ok_or_else(|| {
            SimError::NotFound(format!(
                "parameter {} (only {} parameters defined)",
                parameter_id,
                self.values.len()
            ))
        })
    }

    pub fn data(&self) -> &[f64] {
        &self.values
    }

    pub fn data_mut(&mut self) -> &mut [f64] {
        &mut self.values
    }

    pub fn copy_from(&mut self, other: &ParameterState) {
        self.values.clone_from(&other.values);
    }
}

impl From<Vec<f64>> for ParameterState {
    fn from(values: Vec<f64>) -> Self {
        Self::new(values)
    }
}
