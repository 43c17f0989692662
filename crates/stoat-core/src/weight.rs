// WeightTensor — a value tensor paired with its (optional) gradient.
//
// Parameters and activations both live behind this type during training:
// the weight slot holds the forward value, the gradient slot fills lazily
// the first time backward needs it. Both slots obey an explicit lifecycle:
//
//   * assigning an occupied slot without releasing first is an error that
//     names the call which performed the earlier assignment;
//   * weight and gradient must agree in shape;
//   * after release() every access fails, naming the tensor;
//   * release hands exclusively-held buffers back to the backend allocator.
//
// Gradient accumulation follows one contract everywhere: copy-or-add. The
// first contribution becomes the gradient, later contributions are added in
// place. `add_gradient_from` is the multi-producer entry point — the slot
// state sits behind a mutex and the source gradient is snapshotted into a
// temporary before the read-modify-write, so concurrent producers cannot
// interleave partial sums or alias the destination.

use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backend::Backend;
use crate::backprop::GradStore;
use crate::dtype::DType;
use crate::error::{Error, Result};
use crate::graph::Graph;
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Random-fill family for trainable weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormType {
    /// Glorot/Xavier-style uniform: ±sqrt(6/(fan_in+fan_out)), or
    /// ±sqrt(3/fan) when only one side is known.
    Uniform,
    /// Uniform in [-1, 1]. The name is historical; checkpoints trained
    /// against this fill depend on the exact distribution, so it stays.
    Normal,
}

/// Persistence seam between weight tensors and the model weight store.
/// The store side decides raw vs. quantized representation.
pub trait WeightIo {
    fn add_weights(&mut self, name: &str, values: Vec<f32>);
    fn get_weights(&self, name: &str) -> Option<Vec<f32>>;
}

struct SlotState<B: Backend> {
    weight: Option<Tensor<B>>,
    weight_set_by: String,
    grad: Option<Tensor<B>>,
    grad_set_by: String,
    released: bool,
}

pub(crate) struct WeightInner<B: Backend> {
    name: String,
    shape: Shape,
    dtype: DType,
    device: B::Device,
    trainable: bool,
    lr_factor: f64,
    state: Mutex<SlotState<B>>,
    /// Graph this tensor is bound to for scope-exit release, if any.
    owner: Mutex<Option<Graph<B>>>,
}

/// A weight (or activation) tensor plus its lazily-allocated gradient.
///
/// Cloning shares the same slots; release through any clone is visible to
/// all of them.
pub struct WeightTensor<B: Backend> {
    inner: Arc<WeightInner<B>>,
}

impl<B: Backend> Clone for WeightTensor<B> {
    fn clone(&self) -> Self {
        WeightTensor {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for WeightTensor<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "WeightTensor('{}', shape={}, dtype={}, trainable={})",
            self.inner.name, self.inner.shape, self.inner.dtype, self.inner.trainable
        )
    }
}

impl<B: Backend> WeightTensor<B> {
    // Construction

    /// Full constructor. Trainable tensors get their weight buffer eagerly,
    /// filled per `norm`; non-trainable ones allocate lazily (zero-filled)
    /// on first access. Passing a graph binds the new tensor for release
    /// when that graph's scope ends.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
        trainable: bool,
        norm: NormType,
        fan_in: Option<usize>,
        fan_out: Option<usize>,
        lr_factor: f64,
        graph: Option<&Graph<B>>,
    ) -> Result<Self> {
        let shape = shape.into();
        let weight = if trainable {
            Some(init_fill::<B>(&shape, dtype, device, norm, fan_in, fan_out)?)
        } else {
            None
        };
        let wt = Self::from_parts(name, shape, dtype, device, trainable, lr_factor, weight);
        if let Some(g) = graph {
            g.bind(&wt);
        }
        Ok(wt)
    }

    /// Trainable parameter with default learning-rate factor, unbound.
    pub fn trainable(
        name: impl Into<String>,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
        norm: NormType,
        fan_in: Option<usize>,
        fan_out: Option<usize>,
    ) -> Result<Self> {
        Self::new(
            name, shape, dtype, device, true, norm, fan_in, fan_out, 1.0, None,
        )
    }

    /// Non-trainable activation holder; the weight buffer appears lazily,
    /// zero-filled.
    pub fn activation(
        name: impl Into<String>,
        shape: impl Into<Shape>,
        dtype: DType,
        device: &B::Device,
        graph: Option<&Graph<B>>,
    ) -> Result<Self> {
        Self::new(
            name,
            shape,
            dtype,
            device,
            false,
            NormType::Normal,
            None,
            None,
            1.0,
            graph,
        )
    }

    /// Weight buffer filled with a constant. `trainable` decides whether
    /// the tensor participates in gradient distribution (bias vectors and
    /// norm scales are constant-initialized but trained).
    pub fn constant(
        name: impl Into<String>,
        shape: impl Into<Shape>,
        value: f64,
        dtype: DType,
        device: &B::Device,
        trainable: bool,
    ) -> Result<Self> {
        let shape = shape.into();
        let weight = Tensor::<B>::full(shape.clone(), value, dtype, device)?.set_variable();
        Ok(Self::from_parts(
            name,
            shape,
            dtype,
            device,
            trainable,
            1.0,
            Some(weight),
        ))
    }

    /// Wrap an existing tensor (e.g. an op result that needs a gradient
    /// slot for backward seeding).
    pub fn from_tensor(name: impl Into<String>, tensor: Tensor<B>) -> Self {
        let shape = tensor.shape().clone();
        let dtype = tensor.dtype();
        let device = tensor.device().clone();
        Self::from_parts(name, shape, dtype, &device, false, 1.0, Some(tensor))
    }

    fn from_parts(
        name: impl Into<String>,
        shape: Shape,
        dtype: DType,
        device: &B::Device,
        trainable: bool,
        lr_factor: f64,
        weight: Option<Tensor<B>>,
    ) -> Self {
        let set_by = if weight.is_some() {
            "construction".to_string()
        } else {
            String::new()
        };
        WeightTensor {
            inner: Arc::new(WeightInner {
                name: name.into(),
                shape,
                dtype,
                device: device.clone(),
                trainable,
                lr_factor,
                state: Mutex::new(SlotState {
                    weight,
                    weight_set_by: set_by,
                    grad: None,
                    grad_set_by: String::new(),
                    released: false,
                }),
                owner: Mutex::new(None),
            }),
        }
    }

    // Metadata

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn shape(&self) -> &Shape {
        &self.inner.shape
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> &B::Device {
        &self.inner.device
    }

    pub fn is_trainable(&self) -> bool {
        self.inner.trainable
    }

    pub fn lr_factor(&self) -> f64 {
        self.inner.lr_factor
    }

    pub fn is_released(&self) -> bool {
        self.inner.state.lock().unwrap().released
    }

    /// Identity of the shared slots; two clones compare equal.
    pub fn slot_id(&self) -> usize {
        Arc::as_ptr(&self.inner) as usize
    }

    pub(crate) fn weak_ref(&self) -> std::sync::Weak<WeightInner<B>> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn from_arc(inner: Arc<WeightInner<B>>) -> Self {
        WeightTensor { inner }
    }

    fn lock_live(&self) -> Result<MutexGuard<'_, SlotState<B>>> {
        let guard = self.inner.state.lock().unwrap();
        if guard.released {
            return Err(Error::WeightReleased {
                name: self.inner.name.clone(),
            });
        }
        Ok(guard)
    }

    // Weight slot

    /// The weight tensor; lazily allocated zero-filled for non-trainable
    /// tensors. Fails after release.
    pub fn weight(&self) -> Result<Tensor<B>> {
        let mut guard = self.lock_live()?;
        if guard.weight.is_none() {
            let t = Tensor::<B>::zeros(
                self.inner.shape.clone(),
                self.inner.dtype,
                &self.inner.device,
            )?
            .set_variable();
            guard.weight = Some(t);
            guard.weight_set_by = "lazy zero-fill".to_string();
        }
        Ok(guard.weight.as_ref().unwrap().clone())
    }

    /// Assign the weight tensor. The slot must be empty: re-assigning
    /// without a release first is an invariant violation.
    pub fn set_weight(&self, tensor: Tensor<B>, set_by: &str) -> Result<()> {
        if tensor.shape() != &self.inner.shape {
            return Err(Error::ShapeMismatch {
                expected: self.inner.shape.clone(),
                got: tensor.shape().clone(),
            });
        }
        let mut guard = self.lock_live()?;
        if guard.weight.is_some() {
            return Err(Error::WeightAlreadySet {
                name: self.inner.name.clone(),
                set_by: guard.weight_set_by.clone(),
            });
        }
        guard.weight = Some(tensor);
        guard.weight_set_by = set_by.to_string();
        Ok(())
    }

    /// Fill the weight buffer with zeros, in place.
    pub fn clean_weight(&self) -> Result<()> {
        let w = self.weight()?;
        w.update_data_inplace(&vec![0.0; w.elem_count()])
    }

    // Gradient slot

    /// The gradient tensor if one has been demanded yet.
    pub fn gradient(&self) -> Result<Option<Tensor<B>>> {
        Ok(self.lock_live()?.grad.clone())
    }

    /// The gradient tensor, allocating it zero-filled on first demand.
    pub fn grad_or_init(&self) -> Result<Tensor<B>> {
        let mut guard = self.lock_live()?;
        if guard.grad.is_none() {
            let t = Tensor::<B>::zeros(
                self.inner.shape.clone(),
                self.inner.dtype,
                &self.inner.device,
            )?;
            guard.grad = Some(t);
            guard.grad_set_by = "lazy zero-fill".to_string();
        }
        Ok(guard.grad.as_ref().unwrap().clone())
    }

    /// Fill the gradient buffer with zeros (allocating if needed).
    pub fn zero_gradient(&self) -> Result<()> {
        let g = self.grad_or_init()?;
        g.update_data_inplace(&vec![0.0; g.elem_count()])
    }

    /// Fill the gradient buffer with a scalar. Seeds the backward pass when
    /// called on a loss tensor.
    pub fn fill_gradient(&self, value: f64) -> Result<()> {
        let g = self.grad_or_init()?;
        g.update_data_inplace(&vec![value; g.elem_count()])
    }

    /// Make the gradient slot an alias of `src`'s weight buffer (no copy).
    /// Reuses a forward value as its own backward seed; the slot must be
    /// empty.
    pub fn copy_weights_to_gradients(&self, src: &WeightTensor<B>) -> Result<()> {
        let src_weight = src.weight()?;
        if src_weight.shape() != &self.inner.shape {
            return Err(Error::GradientShapeMismatch {
                name: self.inner.name.clone(),
                weight: self.inner.shape.clone(),
                grad: src_weight.shape().clone(),
            });
        }
        let mut guard = self.lock_live()?;
        if guard.grad.is_some() {
            return Err(Error::GradientAlreadySet {
                name: self.inner.name.clone(),
                set_by: guard.grad_set_by.clone(),
            });
        }
        guard.grad = Some(src_weight);
        guard.grad_set_by = "copy_weights_to_gradients".to_string();
        Ok(())
    }

    /// Thread-safe accumulation: gradient += src.gradient.
    ///
    /// The source gradient is snapshotted into a temporary before the
    /// locked read-modify-write, so `self` and `src` may alias and multiple
    /// producers may call concurrently.
    pub fn add_gradient_from(&self, src: &WeightTensor<B>) -> Result<()> {
        let src_grad = match src.gradient()? {
            Some(g) => g,
            None => return Ok(()), // nothing to add
        };
        if src_grad.shape() != &self.inner.shape {
            return Err(Error::GradientShapeMismatch {
                name: self.inner.name.clone(),
                weight: self.inner.shape.clone(),
                grad: src_grad.shape().clone(),
            });
        }
        let tmp = src_grad.to_f64_vec()?; // snapshot before locking self

        let mut guard = self.lock_live()?;
        match &guard.grad {
            Some(g) => {
                let mut acc = g.to_f64_vec()?;
                for (a, b) in acc.iter_mut().zip(tmp.iter()) {
                    *a += b;
                }
                g.update_data_inplace(&acc)?;
            }
            None => {
                let t = Tensor::<B>::from_f64_slice(
                    &tmp,
                    self.inner.shape.clone(),
                    self.inner.dtype,
                    &self.inner.device,
                )?;
                guard.grad = Some(t);
                guard.grad_set_by = "add_gradient_from".to_string();
            }
        }
        Ok(())
    }

    /// Copy-or-add from another weight tensor's gradient.
    pub fn copy_or_add_gradient(&self, src: &WeightTensor<B>) -> Result<()> {
        match src.gradient()? {
            Some(g) => self.copy_or_add_gradient_tensor(&g),
            None => Ok(()),
        }
    }

    /// Copy-or-add a raw gradient contribution: first call copies, later
    /// calls add. The incoming tensor is deep-copied so the slot never
    /// aliases caller-owned storage.
    pub fn copy_or_add_gradient_tensor(&self, contribution: &Tensor<B>) -> Result<()> {
        if contribution.shape() != &self.inner.shape {
            return Err(Error::GradientShapeMismatch {
                name: self.inner.name.clone(),
                weight: self.inner.shape.clone(),
                grad: contribution.shape().clone(),
            });
        }
        let incoming = contribution.to_f64_vec()?;
        let mut guard = self.lock_live()?;
        match &guard.grad {
            Some(g) => {
                let mut acc = g.to_f64_vec()?;
                for (a, b) in acc.iter_mut().zip(incoming.iter()) {
                    *a += b;
                }
                g.update_data_inplace(&acc)?;
            }
            None => {
                let t = Tensor::<B>::from_f64_slice(
                    &incoming,
                    self.inner.shape.clone(),
                    self.inner.dtype,
                    &self.inner.device,
                )?;
                guard.grad = Some(t);
                guard.grad_set_by = "copy_or_add_gradient".to_string();
            }
        }
        Ok(())
    }

    /// Copy-or-add with the softmax derivative fused in: given the softmax
    /// output rows `y` and upstream gradient `dy`, accumulates
    /// y ⊙ (dy − Σ_row(dy ⊙ y)).
    pub fn copy_or_add_gradient_softmax(&self, y: &Tensor<B>, dy: &Tensor<B>) -> Result<()> {
        let dim = y.rank() - 1;
        let dot = dy.mul(y)?.sum(dim, true)?;
        let fused = y.mul(&dy.sub(&dot)?)?;
        self.copy_or_add_gradient_tensor(&fused)
    }

    /// Copy-or-add with the tanh derivative fused in: dy ⊙ (1 − y²) where
    /// `y` is the tanh output.
    pub fn copy_or_add_gradient_tanh(&self, y: &Tensor<B>, dy: &Tensor<B>) -> Result<()> {
        let fused = dy.mul(&y.square()?.rsub_scalar(1.0)?)?;
        self.copy_or_add_gradient_tensor(&fused)
    }

    /// Copy-or-add with the sigmoid derivative fused in: dy ⊙ y(1 − y)
    /// where `y` is the sigmoid output.
    pub fn copy_or_add_gradient_sigmoid(&self, y: &Tensor<B>, dy: &Tensor<B>) -> Result<()> {
        let fused = dy.mul(&y.mul(&y.rsub_scalar(1.0)?)?)?;
        self.copy_or_add_gradient_tensor(&fused)
    }

    /// Pull this tensor's entry out of a backward pass, if any, into the
    /// gradient slot via copy-or-add. Returns whether a gradient was found.
    pub fn apply_grads(&self, grads: &GradStore<B>) -> Result<bool> {
        let weight = self.weight()?;
        match grads.get(&weight) {
            Some(g) => {
                self.copy_or_add_gradient_tensor(&g.contiguous()?)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // Point access (debugging / tests)

    pub fn weight_at(&self, index: &[usize]) -> Result<f64> {
        self.weight()?.value_at(index)
    }

    pub fn set_weight_at(&self, index: &[usize], value: f64) -> Result<()> {
        let w = self.weight()?;
        let strides = w.shape().stride_contiguous();
        let flat: usize = index.iter().zip(strides.iter()).map(|(&i, &s)| i * s).sum();
        let mut data = w.to_f64_vec()?;
        if flat >= data.len() {
            return Err(Error::DimOutOfRange {
                dim: index.len(),
                rank: w.rank(),
            });
        }
        data[flat] = value;
        w.update_data_inplace(&data)
    }

    pub fn gradient_at(&self, index: &[usize]) -> Result<f64> {
        match self.gradient()? {
            Some(g) => g.value_at(index),
            None => Ok(0.0),
        }
    }

    // Host transfer / persistence

    /// The whole weight buffer as a flat f32 array (device→host boundary).
    pub fn to_weight_array(&self) -> Result<Vec<f32>> {
        Ok(self
            .weight()?
            .contiguous()?
            .to_f64_vec()?
            .into_iter()
            .map(|v| v as f32)
            .collect())
    }

    /// Indices of the `n` largest weight values, descending. Bounded
    /// min-heap, O(len · log n).
    pub fn top_weight_indices(&self, n: usize) -> Result<Vec<usize>> {
        use std::cmp::Reverse;

        #[derive(PartialEq)]
        struct Entry(f64, usize);
        impl Eq for Entry {}
        impl PartialOrd for Entry {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Entry {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.0.total_cmp(&other.0).then(other.1.cmp(&self.1))
            }
        }

        let data = self.weight()?.contiguous()?.to_f64_vec()?;
        let n = n.min(data.len());
        let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::with_capacity(n + 1);
        for (i, &v) in data.iter().enumerate() {
            heap.push(Reverse(Entry(v, i)));
            if heap.len() > n {
                heap.pop();
            }
        }
        let mut out: Vec<(f64, usize)> = heap.into_iter().map(|Reverse(e)| (e.0, e.1)).collect();
        out.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)));
        Ok(out.into_iter().map(|(_, i)| i).collect())
    }

    /// Push the flat weights into a store under this tensor's name.
    pub fn save(&self, store: &mut dyn WeightIo) -> Result<()> {
        let values = self.to_weight_array()?;
        store.add_weights(&self.inner.name, values);
        Ok(())
    }

    /// Pull weights back from a store. Returns false (leaving the buffer
    /// untouched) when the store has no entry under this name — absence is
    /// the caller's decision, not a hard failure.
    pub fn load(&self, store: &dyn WeightIo) -> Result<bool> {
        match store.get_weights(&self.inner.name) {
            Some(values) => {
                let data: Vec<f64> = values.into_iter().map(|v| v as f64).collect();
                self.weight()?.update_data_inplace(&data)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    // Release

    /// Free both slots. Buffers still exclusively held are handed back to
    /// the backend allocator. Idempotent; all later access fails with an
    /// error naming this tensor.
    pub fn release(&self) {
        let mut guard = self.inner.state.lock().unwrap();
        if guard.released {
            return;
        }
        guard.released = true;
        if let Some(w) = guard.weight.take() {
            if let Some(storage) = w.try_take_storage() {
                B::recycle(storage, &self.inner.device);
            }
        }
        if let Some(g) = guard.grad.take() {
            if let Some(storage) = g.try_take_storage() {
                B::recycle(storage, &self.inner.device);
            }
        }
        drop(guard);
        self.unbind();
    }

    /// Stop the owning graph (if any) from tracking this tensor's lifetime.
    pub fn unbind(&self) {
        let owner = self.inner.owner.lock().unwrap().take();
        if let Some(graph) = owner {
            graph.unbind(self);
        }
    }

    pub(crate) fn set_owner(&self, graph: &Graph<B>) {
        *self.inner.owner.lock().unwrap() = Some(graph.clone());
    }
}

/// Build the initial weight fill for a trainable tensor.
fn init_fill<B: Backend>(
    shape: &Shape,
    dtype: DType,
    device: &B::Device,
    norm: NormType,
    fan_in: Option<usize>,
    fan_out: Option<usize>,
) -> Result<Tensor<B>> {
    let bound = match norm {
        NormType::Normal => 1.0,
        NormType::Uniform => match (fan_in, fan_out) {
            (Some(fi), Some(fo)) => (6.0 / (fi + fo) as f64).sqrt(),
            (Some(fi), None) => (3.0 / fi as f64).sqrt(),
            (None, Some(fo)) => (3.0 / fo as f64).sqrt(),
            (None, None) => {
                let dims = shape.dims();
                let rows = dims.first().copied().unwrap_or(1);
                let cols = dims.get(1).copied().unwrap_or(1);
                (6.0 / (rows + cols) as f64).sqrt()
            }
        },
    };
    // U(0,1) → U(-bound, bound)
    let t = Tensor::<B>::rand(shape.clone(), dtype, device)?
        .scale_shift(2.0 * bound, -bound)?
        .set_variable();
    Ok(t)
}
