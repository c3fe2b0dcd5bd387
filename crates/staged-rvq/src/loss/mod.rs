//! Reconstruction losses used to pick a candidate at each stage.
//!
//! Lower is better. Encode evaluates the loss for every `(item, candidate)`
//! pair of a stage at once through [`ReconstructionLoss::pairwise`], producing
//! a `(batch, options)` matrix whose per-row argmin becomes the stage digit.


use candle_core::{Result, Tensor, D};

/// Loss between a candidate reconstruction and its target.
pub trait ReconstructionLoss: Send + Sync {
    /// Scalar loss for one candidate against one target, both shaped like a
    /// single item.
    fn loss(&self, candidate: &Tensor, target: &Tensor) -> Result<Tensor>;

    /// Loss for every `(item, candidate)` pair.
    ///
    /// * `candidates` - `(batch, options, *shape)`
    /// * `targets` - `(batch, *shape)`
    ///
    /// Returns a `(batch, options)` tensor. The default evaluates
    /// [`loss`](Self::loss) pair by pair; implementations with a closed form
    /// should override it with a broadcast computation.
    fn pairwise(&self, candidates: &Tensor, targets: &Tensor) -> Result<Tensor> {
        let batch = candidates.dim(0)?;
        let options = candidates.dim(1)?;
        let mut rows = Vec::with_capacity(batch);
        for item in 0..batch {
            let target = targets.get(item)?;
            let item_candidates = candidates.get(item)?;
            let mut row = Vec::with_capacity(options);
            for candidate in 0..options {
                let value = self.loss(&item_candidates.get(candidate)?, &target)?;
                row.push(value.reshape(())?);
            }
            rows.push(Tensor::stack(&row, 0)?);
        }
        Tensor::stack(&rows, 0)
    }
}

/// `candidates - targets[:, None]`, flattened to `(batch, options, item_len)`.
fn broadcast_residual(candidates: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let candidates = candidates.flatten_from(2)?;
    let targets = targets.flatten_from(1)?.unsqueeze(1)?;
    candidates.broadcast_sub(&targets)
}

/// Mean squared error over the item's elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct SquaredError;

impl ReconstructionLoss for SquaredError {
    fn loss(&self, candidate: &Tensor, target: &Tensor) -> Result<Tensor> {
        (candidate - target)?.sqr()?.mean_all()
    }

    fn pairwise(&self, candidates: &Tensor, targets: &Tensor) -> Result<Tensor> {
        broadcast_residual(candidates, targets)?.sqr()?.mean(D::Minus1)
    }
}

/// Mean absolute error over the item's elements.
#[derive(Debug, Clone, Copy, Default)]
pub struct AbsoluteError;

impl ReconstructionLoss for AbsoluteError {
    fn loss(&self, candidate: &Tensor, target: &Tensor) -> Result<Tensor> {
        (candidate - target)?.abs()?.mean_all()
    }

    fn pairwise(&self, candidates: &Tensor, targets: &Tensor) -> Result<Tensor> {
        broadcast_residual(candidates, targets)?.abs()?.mean(D::Minus1)
    }
}

/// Adapter for an arbitrary per-pair loss closure.
///
/// Falls back to pair-by-pair evaluation, so it is slower than the built-in
/// losses on wide codebooks.
pub struct PairwiseFn<F> {
    f: F,
}

impl<F> PairwiseFn<F>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor> + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> ReconstructionLoss for PairwiseFn<F>
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor> + Send + Sync,
{
    fn loss(&self, candidate: &Tensor, target: &Tensor) -> Result<Tensor> {
        (self.f)(candidate, target)
    }
}

impl<F> std::fmt::Debug for PairwiseFn<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PairwiseFn").finish_non_exhaustive()
    }
}
