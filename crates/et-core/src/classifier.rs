//! Classifier adapter.
//!
//! Wraps an opaque expression model and turns its score vector into a
//! single [`Category`]. Decoding, resizing and training are the model's
//! business.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::category::Category;

/// Classification failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    /// No model has been loaded yet.
    #[error("expression model is not loaded")]
    ModelUnavailable,

    /// The model's output does not line up with the category enumeration.
    #[error("model outputs {actual} scores, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// Every score was NaN.
    #[error("model produced no usable score")]
    NoUsableScore,
}

/// A decoded RGB frame.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Row-major RGB bytes.
    pub pixels: Vec<u8>,
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("pixels", &format_args!("[{} bytes]", self.pixels.len()))
            .finish()
    }
}

/// An image classifier with one score per category.
pub trait ExpressionModel: Send + Sync {
    /// Length of every prediction vector.
    fn output_dim(&self) -> usize;

    /// Scores the frame. Index `i` scores `Category::ALL[i]`.
    fn predict(&self, frame: &Frame) -> Vec<f32>;
}

/// Holds the loaded model, if any, and maps predictions to categories.
#[derive(Clone, Default)]
pub struct ClassifierAdapter {
    model: Option<Arc<dyn ExpressionModel>>,
}

impl fmt::Debug for ClassifierAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifierAdapter")
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl ClassifierAdapter {
    /// Creates an adapter with no model loaded.
    pub fn unloaded() -> Self {
        Self::default()
    }

    /// Creates an adapter around an already loaded model.
    pub fn with_model(model: Arc<dyn ExpressionModel>) -> Result<Self, ClassifyError> {
        let mut adapter = Self::unloaded();
        adapter.load(model)?;
        Ok(adapter)
    }

    /// Installs a model, replacing any previous one.
    pub fn load(&mut self, model: Arc<dyn ExpressionModel>) -> Result<(), ClassifyError> {
        let actual = model.output_dim();
        if actual != Category::COUNT {
            return Err(ClassifyError::DimensionMismatch {
                expected: Category::COUNT,
                actual,
            });
        }
        self.model = Some(model);
        tracing::info!(categories = Category::COUNT, "expression model loaded");
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Classifies one frame.
    pub fn classify(&self, frame: &Frame) -> Result<Category, ClassifyError> {
        let model = self.model.as_ref().ok_or(ClassifyError::ModelUnavailable)?;
        let scores = model.predict(frame);
        if scores.len() != Category::COUNT {
            return Err(ClassifyError::DimensionMismatch {
                expected: Category::COUNT,
                actual: scores.len(),
            });
        }
        arg_max(&scores)
            .and_then(Category::from_index)
            .ok_or(ClassifyError::NoUsableScore)
    }
}

/// Index of the highest score. Ties go to the lowest index; NaN is skipped.
fn arg_max(scores: &[f32]) -> Option<usize> {
    scores
        .iter()
        .enumerate()
        .filter(|(_, score)| !score.is_nan())
        .fold(None, |best: Option<(usize, f32)>, (i, &score)| match best {
            Some((_, top)) if top >= score => best,
            _ => Some((i, score)),
        })
        .map(|(i, _)| i)
}
