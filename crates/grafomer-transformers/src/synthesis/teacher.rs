//! The teacher-parameter table and role addressing.

use anyhow::Result;
use ndarray::{Array1, Array2};

use crate::error::ConfigurationError;

/// Which half of the teacher a role addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeacherScope {
    Encoder,
    Decoder,
}

impl TeacherScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TeacherScope::Encoder => "encoder",
            TeacherScope::Decoder => "decoder",
        }
    }
}

/// A parameter role: a scope plus a dotted path shared by one tensor per
/// teacher layer (e.g. `encoder.attention.self.query`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterRole {
    pub scope: TeacherScope,
    pub path: String,
}

impl ParameterRole {
    pub fn parse(role: &str) -> Result<Self> {
        let (scope_str, path) = role
            .split_once('.')
            .ok_or_else(|| ConfigurationError::InvalidRole(role.to_string()))?;

        let scope = match scope_str {
            "encoder" => TeacherScope::Encoder,
            "decoder" => TeacherScope::Decoder,
            other => {
                return Err(ConfigurationError::UnknownScope(other.to_string()).into());
            }
        };

        if path.is_empty() {
            return Err(ConfigurationError::InvalidRole(role.to_string()).into());
        }

        Ok(Self {
            scope,
            path: path.to_string(),
        })
    }
}

/// One named teacher tensor. Weight matrices and bias vectors are kept as
/// separate variants so a role never mixes the two.
#[derive(Debug, Clone)]
pub enum TeacherParameter {
    Matrix(Array2<f32>),
    Vector(Array1<f32>),
}

/// An explicit, read-only handle to one teacher network's parameters.
///
/// Registration order within a scope must follow ascending teacher-layer
/// order; the selector relies on it for layer-contiguous slicing. The
/// context is built once, before any student component, and passed down
/// every construction call chain.
#[derive(Default)]
pub struct TeacherContext {
    encoder: Vec<(String, TeacherParameter)>,
    decoder: Vec<(String, TeacherParameter)>,
}

impl TeacherContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named parameter under a scope, preserving order.
    pub fn register(
        &mut self,
        scope: TeacherScope,
        name: impl Into<String>,
        parameter: TeacherParameter,
    ) {
        let table = match scope {
            TeacherScope::Encoder => &mut self.encoder,
            TeacherScope::Decoder => &mut self.decoder,
        };
        table.push((name.into(), parameter));
    }

    pub fn register_matrix(
        &mut self,
        scope: TeacherScope,
        name: impl Into<String>,
        matrix: Array2<f32>,
    ) {
        self.register(scope, name, TeacherParameter::Matrix(matrix));
    }

    pub fn register_vector(
        &mut self,
        scope: TeacherScope,
        name: impl Into<String>,
        vector: Array1<f32>,
    ) {
        self.register(scope, name, TeacherParameter::Vector(vector));
    }

    pub fn scoped(&self, scope: TeacherScope) -> &[(String, TeacherParameter)] {
        match scope {
            TeacherScope::Encoder => &self.encoder,
            TeacherScope::Decoder => &self.decoder,
        }
    }

    pub fn is_empty(&self, scope: TeacherScope) -> bool {
        self.scoped(scope).is_empty()
    }

    /// All weight matrices whose name contains `path`, in registration order.
    pub fn matrices_matching(&self, scope: TeacherScope, path: &str) -> Vec<&Array2<f32>> {
        self.scoped(scope)
            .iter()
            .filter(|(name, _)| name.contains(path))
            .filter_map(|(_, param)| match param {
                TeacherParameter::Matrix(m) => Some(m),
                TeacherParameter::Vector(_) => None,
            })
            .collect()
    }

    /// All bias vectors whose name contains `path`, in registration order.
    pub fn vectors_matching(&self, scope: TeacherScope, path: &str) -> Vec<&Array1<f32>> {
        self.scoped(scope)
            .iter()
            .filter(|(name, _)| name.contains(path))
            .filter_map(|(_, param)| match param {
                TeacherParameter::Vector(v) => Some(v),
                TeacherParameter::Matrix(_) => None,
            })
            .collect()
    }
}
