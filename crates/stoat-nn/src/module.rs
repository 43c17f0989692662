// Module — the seam between layers and everything that iterates over
// parameters (optimizers, the weight store, diagnostics).
//
// Layers own WeightTensors; the trait exposes them flat and by name and
// provides store save/load over that surface. Forward signatures stay
// inherent per layer — a recurrent cell takes carried state, the MoE layer
// takes a token matrix — so `forward` is deliberately not part of this
// trait.

use stoat_core::backend::Backend;
use stoat_core::error::Result;
use stoat_core::weight::{WeightIo, WeightTensor};

/// Interface every trainable layer implements.
pub trait Module<B: Backend> {
    /// All weight tensors of this layer.
    fn params(&self) -> Vec<WeightTensor<B>>;

    /// Parameters with their store-qualified names. The default uses each
    /// tensor's own name, which layer constructors already prefix.
    fn named_params(&self) -> Vec<(String, WeightTensor<B>)> {
        self.params()
            .into_iter()
            .map(|p| (p.name().to_string(), p))
            .collect()
    }

    /// Total scalar parameter count.
    fn num_parameters(&self) -> usize {
        self.params().iter().map(|p| p.shape().elem_count()).sum()
    }

    /// Push every parameter's flat weights into the store.
    fn save(&self, store: &mut dyn WeightIo) -> Result<()> {
        for param in self.params() {
            param.save(store)?;
        }
        Ok(())
    }

    /// Pull parameters back from the store. Entries missing from the store
    /// leave the current values in place; returns how many were loaded.
    fn load(&self, store: &dyn WeightIo) -> Result<usize> {
        let mut loaded = 0;
        for param in self.params() {
            if param.load(store)? {
                loaded += 1;
            }
        }
        Ok(loaded)
    }
}
