// Reverse-mode automatic differentiation.
//
// The forward pass already recorded the DAG (every tensor carries the Op
// that produced it), so backward() is: topologically sort from the root,
// seed the root's gradient, then walk in reverse order applying one chain
// rule per op and accumulating into a GradStore.
//
// Accumulation is copy-or-add: the first contribution to a tensor is
// stored, every later one is added. A tensor consumed by two ops therefore
// receives the sum of both contributions and never loses the first — the
// multivariate chain rule, and the same contract WeightTensor uses when it
// pulls gradients out of the store.

use std::collections::{HashMap, HashSet};

use crate::backend::{Backend, BinaryOp, ReduceOp, UnaryOp};
use crate::error::{Error, Result};
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Gradients keyed by tensor id, produced by a backward pass.
pub struct GradStore<B: Backend> {
    grads: HashMap<TensorId, Tensor<B>>,
}

impl<B: Backend> Default for GradStore<B> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: Backend> GradStore<B> {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    pub fn get(&self, tensor: &Tensor<B>) -> Option<&Tensor<B>> {
        self.grads.get(&tensor.id())
    }

    pub fn get_by_id(&self, id: &TensorId) -> Option<&Tensor<B>> {
        self.grads.get(id)
    }

    /// First contribution is stored as-is; later contributions are added.
    /// Never overwrites an earlier sibling's gradient.
    pub fn copy_or_add(&mut self, id: TensorId, grad: Tensor<B>) -> Result<()> {
        if let Some(existing) = self.grads.get(&id) {
            let summed = existing.add(&grad)?;
            self.grads.insert(id, summed);
        } else {
            self.grads.insert(id, grad);
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }
}

/// DFS post-order: every tensor appears after all of its inputs.
fn build_topo<B: Backend>(root: &Tensor<B>) -> Vec<Tensor<B>> {
    fn visit<B: Backend>(
        t: &Tensor<B>,
        seen: &mut HashSet<TensorId>,
        order: &mut Vec<Tensor<B>>,
    ) {
        if !seen.insert(t.id()) {
            return;
        }
        for input in t.op().inputs() {
            visit(input, seen, order);
        }
        order.push(t.clone());
    }

    let mut seen = HashSet::new();
    let mut order = Vec::new();
    visit(root, &mut seen, &mut order);
    order
}

/// Backward from a scalar root, seeding d(root)/d(root) = 1.
pub fn backward<B: Backend>(root: &Tensor<B>) -> Result<GradStore<B>> {
    if root.elem_count() != 1 {
        return Err(Error::msg(
            "backward() needs a scalar root; reduce with sum_all()/mean_all() first, \
             or pass an explicit seed to backward_with_seed()",
        ));
    }
    let seed = Tensor::<B>::ones(root.shape().clone(), root.dtype(), root.device())?;
    backward_with_seed(root, &seed)
}

/// Backward from any root whose gradient seed is supplied by the caller
/// (e.g. a loss tensor seeded through its weight-tensor gradient slot).
pub fn backward_with_seed<B: Backend>(root: &Tensor<B>, seed: &Tensor<B>) -> Result<GradStore<B>> {
    if seed.shape() != root.shape() {
        return Err(Error::ShapeMismatch {
            expected: root.shape().clone(),
            got: seed.shape().clone(),
        });
    }

    let topo = build_topo(root);
    let mut grads = GradStore::new();
    grads.copy_or_add(root.id(), seed.clone())?;

    for tensor in topo.iter().rev() {
        let grad_out = match grads.get_by_id(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue, // no gradient reaches this tensor
        };

        match tensor.op() {
            Op::None => {}

            Op::Contiguous { input } => {
                grads.copy_or_add(input.id(), grad_out)?;
            }

            Op::Binary { lhs, rhs, op } => {
                binary_grad(*op, &grad_out, lhs, rhs, &mut grads)?;
            }

            Op::Unary { input, op } => {
                unary_grad(*op, &grad_out, input, &mut grads)?;
            }

            Op::ScaleShift { input, mul } => {
                let g = grad_out.scale_shift(*mul, 0.0)?;
                grads.copy_or_add(input.id(), g)?;
            }

            Op::MulMulAdd { a, b, c, d } => {
                grads.copy_or_add(a.id(), grad_out.mul(b)?)?;
                grads.copy_or_add(b.id(), grad_out.mul(a)?)?;
                grads.copy_or_add(c.id(), grad_out.mul(d)?)?;
                grads.copy_or_add(d.id(), grad_out.mul(c)?)?;
            }

            Op::Reduce {
                input,
                op,
                dims,
                keep_dim,
            } => {
                reduce_grad(*op, &grad_out, input, dims, *keep_dim, &mut grads)?;
            }

            Op::Matmul { lhs, rhs } => {
                let r = lhs.rank();
                let rhs_t = rhs.transpose(r - 2, r - 1)?;
                let lhs_t = lhs.transpose(r - 2, r - 1)?;
                grads.copy_or_add(lhs.id(), grad_out.matmul(&rhs_t)?)?;
                grads.copy_or_add(rhs.id(), lhs_t.matmul(&grad_out)?)?;
            }

            Op::Reshape { input, src_shape } => {
                grads.copy_or_add(input.id(), grad_out.reshape(src_shape.clone())?)?;
            }

            Op::Transpose { input, dim0, dim1 } => {
                grads.copy_or_add(input.id(), grad_out.transpose(*dim0, *dim1)?)?;
            }

            Op::Narrow {
                input,
                dim,
                start,
                len,
            } => {
                // Gradient lands back in the sliced region of a zero tensor.
                let zeros = Tensor::<B>::zeros_like(input)?;
                let rows: Vec<usize> = (*start..start + len).collect();
                let g = zeros.index_update(*dim, &rows, &grad_out.contiguous()?)?;
                grads.copy_or_add(input.id(), g)?;
            }

            Op::Cat { inputs, dim, sizes } => {
                let mut offset = 0;
                for (input, &sz) in inputs.iter().zip(sizes.iter()) {
                    let slice = grad_out.narrow(*dim, offset, sz)?;
                    grads.copy_or_add(input.id(), slice)?;
                    offset += sz;
                }
            }

            Op::Gather { input, index, dim } => {
                // Inverse of gather is scatter-add: every gathered position
                // sends its gradient back where it was read from.
                let zeros = Tensor::<B>::zeros_like(input)?;
                let g = zeros.scatter_add(*dim, index, &grad_out)?;
                grads.copy_or_add(input.id(), g)?;
            }

            Op::Scatter {
                base,
                index,
                src,
                dim,
                accumulate,
            } => {
                // src always receives the gradient at its target positions.
                grads.copy_or_add(src.id(), grad_out.gather(*dim, index)?)?;
                // base keeps its gradient everywhere it wasn't overwritten;
                // with accumulation nothing was overwritten at all.
                let g_base = if *accumulate {
                    grad_out.clone()
                } else {
                    grad_out.scatter_fill(*dim, index, 0.0)?
                };
                grads.copy_or_add(base.id(), g_base)?;
            }

            Op::IndexSelect {
                input,
                indices,
                dim,
            } => {
                let zeros = Tensor::<B>::zeros_like(input)?;
                let g = zeros.index_add(*dim, indices, &grad_out.contiguous()?)?;
                grads.copy_or_add(input.id(), g)?;
            }

            Op::IndexUpdate {
                base,
                indices,
                src,
                dim,
                accumulate,
            } => {
                grads.copy_or_add(src.id(), grad_out.index_select(*dim, indices)?)?;
                let g_base = if *accumulate {
                    grad_out.clone()
                } else {
                    let blank = Tensor::<B>::zeros(
                        src.shape().clone(),
                        grad_out.dtype(),
                        grad_out.device(),
                    )?;
                    grad_out.index_update(*dim, indices, &blank)?
                };
                grads.copy_or_add(base.id(), g_base)?;
            }
        }
    }

    Ok(grads)
}

/// Undo broadcasting: sum the gradient down to `target`'s shape.
fn reduce_to_shape<B: Backend>(grad: &Tensor<B>, target: &Shape) -> Result<Tensor<B>> {
    let mut g = grad.clone();
    while g.rank() > target.rank() {
        g = g.sum(0, false)?;
    }
    for d in 0..target.rank() {
        if target.dims()[d] == 1 && g.dims()[d] != 1 {
            g = g.sum(d, true)?;
        }
    }
    if g.shape() != target {
        g = g.reshape(target.clone())?;
    }
    Ok(g)
}

fn binary_grad<B: Backend>(
    op: BinaryOp,
    grad_out: &Tensor<B>,
    lhs: &Tensor<B>,
    rhs: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let (g_lhs, g_rhs) = match op {
        BinaryOp::Add => (grad_out.clone(), grad_out.clone()),
        BinaryOp::Sub => (grad_out.clone(), grad_out.neg()?),
        BinaryOp::Mul => (grad_out.mul(rhs)?, grad_out.mul(lhs)?),
        BinaryOp::Div => {
            // d(a/b)/da = 1/b;  d(a/b)/db = -a/b²
            let g_l = grad_out.div(rhs)?;
            let g_r = grad_out.mul(lhs)?.div(&rhs.square()?)?.neg()?;
            (g_l, g_r)
        }
    };
    grads.copy_or_add(lhs.id(), reduce_to_shape(&g_lhs, lhs.shape())?)?;
    grads.copy_or_add(rhs.id(), reduce_to_shape(&g_rhs, rhs.shape())?)?;
    Ok(())
}

fn unary_grad<B: Backend>(
    op: UnaryOp,
    grad_out: &Tensor<B>,
    input: &Tensor<B>,
    grads: &mut GradStore<B>,
) -> Result<()> {
    let g = match op {
        UnaryOp::Neg => grad_out.neg()?,
        UnaryOp::Exp => grad_out.mul(&input.exp()?)?,
        UnaryOp::Log => grad_out.div(input)?,
        UnaryOp::Sqrt => grad_out.div(&input.sqrt()?)?.scale_shift(0.5, 0.0)?,
        // d(x^-1/2)/dx = -1/2 · x^-3/2 = -1/2 · rsqrt(x)/x
        UnaryOp::Rsqrt => grad_out
            .mul(&input.rsqrt()?.div(input)?)?
            .scale_shift(-0.5, 0.0)?,
        UnaryOp::Square => grad_out.mul(input)?.scale_shift(2.0, 0.0)?,
        UnaryOp::Relu => {
            // Subgradient: pass where x > 0.
            let x = input.to_f64_vec()?;
            let go = grad_out.to_f64_vec()?;
            let masked: Vec<f64> = x
                .iter()
                .zip(go.iter())
                .map(|(&xi, &gi)| if xi > 0.0 { gi } else { 0.0 })
                .collect();
            Tensor::<B>::from_f64_slice(
                &masked,
                input.shape().clone(),
                input.dtype(),
                input.device(),
            )?
        }
        UnaryOp::Sigmoid => {
            let s = input.sigmoid()?;
            grad_out.mul(&s.mul(&s.rsub_scalar(1.0)?)?)?
        }
        UnaryOp::Tanh => {
            let t = input.tanh()?;
            grad_out.mul(&t.square()?.rsub_scalar(1.0)?)?
        }
        UnaryOp::Silu => {
            // d(x·σ)/dx = σ·(1 + x·(1−σ))
            let s = input.sigmoid()?;
            let inner = input.mul(&s.rsub_scalar(1.0)?)?.scale_shift(1.0, 1.0)?;
            grad_out.mul(&s.mul(&inner)?)?
        }
    };
    grads.copy_or_add(input.id(), g)
}

fn reduce_grad<B: Backend>(
    op: ReduceOp,
    grad_out: &Tensor<B>,
    input: &Tensor<B>,
    dims: &[usize],
    keep_dim: bool,
    grads: &mut GradStore<B>,
) -> Result<()> {
    match op {
        ReduceOp::Sum | ReduceOp::Mean => {
            let scale = if op == ReduceOp::Mean {
                let n: usize = if dims.is_empty() {
                    input.elem_count()
                } else {
                    dims.iter().map(|&d| input.dims()[d]).product()
                };
                1.0 / n as f64
            } else {
                1.0
            };

            let g = if dims.is_empty() {
                // Full reduction: every element gets the (scaled) scalar.
                let v = grad_out.scalar_value()? * scale;
                Tensor::<B>::full(input.shape().clone(), v, input.dtype(), input.device())?
            } else {
                // Re-insert reduced axes, then broadcast up via add-to-zero.
                let mut g = grad_out.clone();
                if !keep_dim {
                    let mut sorted = dims.to_vec();
                    sorted.sort_unstable();
                    for &d in &sorted {
                        g = g.unsqueeze(d)?;
                    }
                }
                let zeros = Tensor::<B>::zeros_like(input)?;
                g.scale_shift(scale, 0.0)?.add(&zeros)?
            };
            grads.copy_or_add(input.id(), g)?;
        }
        ReduceOp::Max => {
            // Route the gradient to the first maximal element of each slice.
            if dims.len() != 1 {
                return Err(Error::msg("max backward supports a single reduce dim"));
            }
            let dim = dims[0];
            let in_dims = input.dims().to_vec();
            let dim_size = in_dims[dim];
            let inner: usize = in_dims[dim + 1..].iter().product();
            let outer: usize = in_dims[..dim].iter().product();

            let x = input.contiguous()?.to_f64_vec()?;
            let go = grad_out.contiguous()?.to_f64_vec()?;
            let mut gi = vec![0.0f64; x.len()];
            for o in 0..outer {
                for i in 0..inner {
                    let mut best = 0usize;
                    let mut best_v = f64::NEG_INFINITY;
                    for d in 0..dim_size {
                        let v = x[(o * dim_size + d) * inner + i];
                        if v > best_v {
                            best_v = v;
                            best = d;
                        }
                    }
                    gi[(o * dim_size + best) * inner + i] = go[o * inner + i];
                }
            }
            let g = Tensor::<B>::from_f64_slice(
                &gi,
                input.shape().clone(),
                input.dtype(),
                input.device(),
            )?;
            grads.copy_or_add(input.id(), g)?;
        }
        ReduceOp::ArgMax => {
            // Integer output — non-differentiable.
        }
    }
    Ok(())
}
