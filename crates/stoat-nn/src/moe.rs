// Mixture-of-experts feed-forward — token-level sparse routing.
//
// Per forward pass over [tokens, d_model]:
//   1. layer-normalize the input
//   2. router: affine to expert logits, softmax to a distribution per token
//   3. stable top-k picks each token's experts
//   4. per expert: select its tokens, run the two-layer transform
//      (expand 4×, activate, project back), scale each row by that token's
//      router probability, and accumulate onto the residual input
//
// Tokens outside an expert's assignment receive nothing from it. Expert
// weights are packed in 3-D tensors indexed by expert id, so parameter
// storage stays contiguous and save/load sees one tensor per matrix.
//
// The router probability used for scaling is gathered from the softmax
// output, so gradients flow back into the router through the scale.

use stoat_core::backend::Backend;
use stoat_core::dtype::DType;
use stoat_core::error::{Error, Result};
use stoat_core::graph::Graph;
use stoat_core::tensor::Tensor;
use stoat_core::weight::{NormType, WeightTensor};
use tracing::debug;

use crate::layernorm::LayerNorm;
use crate::module::Module;

/// Expert activation, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Relu,
    /// Swish: x·sigmoid(x).
    Silu,
}

impl Activation {
    fn apply<B: Backend>(&self, x: &Tensor<B>) -> Result<Tensor<B>> {
        match self {
            Activation::Relu => x.relu(),
            Activation::Silu => x.silu(),
        }
    }
}

/// Token-level mixture-of-experts dense layer.
pub struct MoeFeedForward<B: Backend> {
    norm: LayerNorm<B>,
    /// Router projection [d_model, experts].
    w_router: WeightTensor<B>,
    /// Router bias [1, experts].
    b_router: WeightTensor<B>,
    /// Expansion weights, packed per expert: [experts, d_model, hidden].
    w1: WeightTensor<B>,
    /// Expansion biases [experts, hidden].
    b1: WeightTensor<B>,
    /// Projection weights [experts, hidden, d_model].
    w2: WeightTensor<B>,
    /// Projection biases [experts, d_model].
    b2: WeightTensor<B>,
    activation: Activation,
    pub d_model: usize,
    pub hidden: usize,
    pub num_experts: usize,
    /// Experts consulted per token (the k of top-k routing).
    pub experts_per_token: usize,
    /// Emit per-expert token counts at debug level on every forward pass.
    pub router_stats: bool,
}

impl<B: Backend> MoeFeedForward<B> {
    pub fn new(
        name: &str,
        d_model: usize,
        num_experts: usize,
        experts_per_token: usize,
        activation: Activation,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        if experts_per_token == 0 || experts_per_token > num_experts {
            return Err(Error::msg(format!(
                "experts_per_token {experts_per_token} out of range for {num_experts} experts"
            )));
        }
        let hidden = 4 * d_model;
        let norm = LayerNorm::new(&format!("{name}.norm"), d_model, 1e-5, dtype, device)?;
        let w_router = WeightTensor::trainable(
            format!("{name}.w_router"),
            (d_model, num_experts),
            dtype,
            device,
            NormType::Uniform,
            Some(d_model),
            Some(num_experts),
        )?;
        let b_router = WeightTensor::constant(
            format!("{name}.b_router"),
            (1, num_experts),
            0.0,
            dtype,
            device,
            true,
        )?;
        let w1 = WeightTensor::trainable(
            format!("{name}.w1"),
            (num_experts, d_model, hidden),
            dtype,
            device,
            NormType::Uniform,
            Some(d_model),
            Some(hidden),
        )?;
        let b1 = WeightTensor::constant(
            format!("{name}.b1"),
            (num_experts, hidden),
            0.0,
            dtype,
            device,
            true,
        )?;
        let w2 = WeightTensor::trainable(
            format!("{name}.w2"),
            (num_experts, hidden, d_model),
            dtype,
            device,
            NormType::Uniform,
            Some(hidden),
            Some(d_model),
        )?;
        let b2 = WeightTensor::constant(
            format!("{name}.b2"),
            (num_experts, d_model),
            0.0,
            dtype,
            device,
            true,
        )?;
        Ok(MoeFeedForward {
            norm,
            w_router,
            b_router,
            w1,
            b1,
            w2,
            b2,
            activation,
            d_model,
            hidden,
            num_experts,
            experts_per_token,
            router_stats: false,
        })
    }

    /// Forward over a token matrix [tokens, d_model].
    pub fn forward(&self, graph: Option<&Graph<B>>, x: &Tensor<B>) -> Result<Tensor<B>> {
        Ok(self.forward_with_probs(graph, x)?.0)
    }

    /// Forward, also returning the router distribution [tokens, experts]
    /// (e.g. for an external load-balancing loss).
    pub fn forward_with_probs(
        &self,
        graph: Option<&Graph<B>>,
        x: &Tensor<B>,
    ) -> Result<(Tensor<B>, Tensor<B>)> {
        if x.rank() != 2 || x.dims()[1] != self.d_model {
            return Err(Error::msg(format!(
                "moe expects [tokens, {}], got shape {}",
                self.d_model,
                x.shape()
            )));
        }
        let tokens = x.dims()[0];
        let k = self.experts_per_token;

        let scope = graph.map(|g| g.subgraph("moe"));

        let h = self.norm.forward(x)?;
        if let Some(s) = &scope {
            let slot = WeightTensor::from_tensor("moe.normed", h.clone());
            s.bind(&slot);
        }

        let logits = h
            .matmul(&self.w_router.weight()?)?
            .add(&self.b_router.weight()?)?;
        let probs = logits.softmax(1)?;

        // Stable top-k: ties go to the lower expert id.
        let (_, top_idx) = probs.topk(k, 1)?;
        let assignment = top_idx.to_f64_vec()?;

        let mut out = x.clone();
        let mut counts = vec![0usize; self.num_experts];

        for expert in 0..self.num_experts {
            let rows: Vec<usize> = (0..tokens)
                .filter(|&t| (0..k).any(|j| assignment[t * k + j] as usize == expert))
                .collect();
            counts[expert] = rows.len();
            if rows.is_empty() {
                continue;
            }

            // This expert's slice of the packed weights.
            let w1_e = self
                .w1
                .weight()?
                .narrow(0, expert, 1)?
                .reshape((self.d_model, self.hidden))?;
            let b1_e = self.b1.weight()?.narrow(0, expert, 1)?;
            let w2_e = self
                .w2
                .weight()?
                .narrow(0, expert, 1)?
                .reshape((self.hidden, self.d_model))?;
            let b2_e = self.b2.weight()?.narrow(0, expert, 1)?;

            let x_e = h.index_select(0, &rows)?;
            let expanded = self.activation.apply(&x_e.matmul(&w1_e)?.add(&b1_e)?)?;
            let y_e = expanded.matmul(&w2_e)?.add(&b2_e)?;

            // Each routed token's probability for this expert, kept in the
            // graph so the router trains through the scale.
            let p_e = probs.index_select(0, &rows)?.narrow(1, expert, 1)?;
            let scaled = y_e.mul(&p_e)?;

            out = out.index_add(0, &rows, &scaled)?;
        }

        if self.router_stats {
            let routed: usize = counts.iter().sum();
            debug!(?counts, routed, tokens, "moe router assignment");
        }

        Ok((out, probs))
    }
}

impl<B: Backend> Module<B> for MoeFeedForward<B> {
    fn params(&self) -> Vec<WeightTensor<B>> {
        let mut params = self.norm.params();
        params.extend([
            self.w_router.clone(),
            self.b_router.clone(),
            self.w1.clone(),
            self.b1.clone(),
            self.w2.clone(),
            self.b2.clone(),
        ]);
        params
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stoat_cpu::{CpuBackend, CpuDevice};

    type T = Tensor<CpuBackend>;
    type Moe = MoeFeedForward<CpuBackend>;

    #[test]
    fn output_keeps_shape() {
        let dev = CpuDevice::default();
        let moe = Moe::new("ffn", 6, 4, 2, Activation::Silu, DType::F64, &dev).unwrap();
        let x = T::rand((5, 6), DType::F64, &dev).unwrap();
        let y = moe.forward(None, &x).unwrap();
        assert_eq!(y.dims(), &[5, 6]);
    }

    #[test]
    fn routing_conserves_token_expert_pairs() {
        let dev = CpuDevice::default();
        let moe = Moe::new("ffn", 4, 3, 2, Activation::Relu, DType::F64, &dev).unwrap();
        let x = T::rand((8, 4), DType::F64, &dev).unwrap();
        let (_, probs) = moe.forward_with_probs(None, &x).unwrap();
        let (_, idx) = probs.topk(2, 1).unwrap();
        let assignment = idx.to_f64_vec().unwrap();
        // Each token contributes exactly k assignments, all distinct.
        let mut total = 0usize;
        for t in 0..8 {
            let a = assignment[t * 2] as usize;
            let b = assignment[t * 2 + 1] as usize;
            assert_ne!(a, b);
            total += 2;
        }
        assert_eq!(total, 8 * 2);
    }

    #[test]
    fn forced_router_isolates_experts() {
        // Route tokens [0,1] to expert 0 and [2,3] to expert 1 by making
        // the router weights decisive, then check exclusivity: each token's
        // output must differ from the input only through its own expert.
        let dev = CpuDevice::default();
        let mut moe = Moe::new("ffn", 2, 2, 1, Activation::Relu, DType::F64, &dev).unwrap();
        moe.router_stats = true;

        // Router reads the raw sign of feature 0 vs feature 1.
        moe.w_router
            .weight()
            .unwrap()
            .update_data_inplace(&[50.0, -50.0, -50.0, 50.0])
            .unwrap();

        let x = T::from_f64_slice(
            &[1.0, 0.0, 1.0, 0.1, 0.0, 1.0, 0.1, 1.0],
            (4, 2),
            DType::F64,
            &dev,
        )
        .unwrap();
        let (y, probs) = moe.forward_with_probs(None, &x).unwrap();
        let (_, idx) = probs.topk(1, 1).unwrap();
        let routes = idx.to_f64_vec().unwrap();
        assert_eq!(routes, vec![0.0, 0.0, 1.0, 1.0]);

        // Zero expert 1's projection output: tokens routed to expert 1
        // must then come back unchanged (residual only), while tokens on
        // expert 0 may not.
        let w2 = moe.w2.weight().unwrap();
        let mut w2_data = w2.to_f64_vec().unwrap();
        let half = w2_data.len() / 2;
        for v in w2_data[half..].iter_mut() {
            *v = 0.0;
        }
        w2.update_data_inplace(&w2_data).unwrap();
        let b2 = moe.b2.weight().unwrap();
        b2.update_data_inplace(&vec![0.0; b2.elem_count()]).unwrap();

        let (y2, _) = moe.forward_with_probs(None, &x).unwrap();
        let xv = x.to_f64_vec().unwrap();
        let yv = y2.to_f64_vec().unwrap();
        // Tokens 2 and 3 ran only through the zeroed expert: pure residual.
        for i in 4..8 {
            assert!((yv[i] - xv[i]).abs() < 1e-9);
        }
        drop(y);
    }

    #[test]
    fn rejects_bad_k() {
        let dev = CpuDevice::default();
        assert!(Moe::new("ffn", 4, 2, 3, Activation::Relu, DType::F64, &dev).is_err());
        assert!(Moe::new("ffn", 4, 2, 0, Activation::Relu, DType::F64, &dev).is_err());
    }

    #[test]
    fn packed_weights_count() {
        let dev = CpuDevice::default();
        let moe = Moe::new("ffn", 4, 3, 1, Activation::Silu, DType::F32, &dev).unwrap();
        // norm (4+4) + router (4*3 + 3) + w1 (3*4*16) + b1 (3*16)
        // + w2 (3*16*4) + b2 (3*4)
        assert_eq!(moe.num_parameters(), 8 + 15 + 192 + 48 + 192 + 12);
    }
}
