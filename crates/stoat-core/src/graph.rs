// Graph — compute-graph scoping and lifetime tracking.
//
// Operator execution is eager and records its own lineage (see op.rs), so
// what remains for the graph object is the part manual bookkeeping used to
// cover: which weight tensors belong to which logical scope, and when they
// may be released. A root graph lives for the whole model; each module
// invocation (an LSTM step, one MoE call) opens a named subgraph, binds the
// temporaries it creates, and the subgraph guard releases them on drop —
// unless the same tensor is also bound further up the parent chain.
//
// The graph holds Weak references: it tracks lifetimes, it does not own the
// tensors. A bound tensor dropped by everyone else simply disappears from
// the list at the next upgrade.

use std::sync::{Arc, Mutex, Weak};

use crate::backend::Backend;
use crate::backprop::{self, GradStore};
use crate::error::Result;
use crate::weight::{WeightInner, WeightTensor};

struct GraphInner<B: Backend> {
    name: String,
    parent: Option<Graph<B>>,
    bound: Mutex<Vec<Weak<WeightInner<B>>>>,
}

/// A named scope tracking the weight tensors created inside it.
pub struct Graph<B: Backend> {
    inner: Arc<GraphInner<B>>,
}

impl<B: Backend> Clone for Graph<B> {
    fn clone(&self) -> Self {
        Graph {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<B: Backend> std::fmt::Debug for Graph<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Graph('{}', bound={})",
            self.inner.name,
            self.inner.bound.lock().unwrap().len()
        )
    }
}

impl<B: Backend> Graph<B> {
    pub fn root() -> Self {
        Self::named("root")
    }

    pub fn named(name: impl Into<String>) -> Self {
        Graph {
            inner: Arc::new(GraphInner {
                name: name.into(),
                parent: None,
                bound: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Open a child scope. Tensors bound only to the child are released
    /// when the returned guard drops.
    pub fn subgraph(&self, name: impl Into<String>) -> SubGraph<B> {
        let child = Graph {
            inner: Arc::new(GraphInner {
                name: format!("{}/{}", self.inner.name, name.into()),
                parent: Some(self.clone()),
                bound: Mutex::new(Vec::new()),
            }),
        };
        SubGraph { graph: child }
    }

    /// Track a weight tensor's lifetime in this scope and make this graph
    /// its owner for unbind notifications.
    pub fn bind(&self, wt: &WeightTensor<B>) {
        self.inner.bound.lock().unwrap().push(wt.weak_ref());
        wt.set_owner(self);
    }

    /// Stop tracking a tensor (the tensor will outlive this scope).
    pub fn unbind(&self, wt: &WeightTensor<B>) {
        let target = wt.weak_ref();
        self.inner
            .bound
            .lock()
            .unwrap()
            .retain(|w| !Weak::ptr_eq(w, &target));
    }

    pub fn is_bound(&self, wt: &WeightTensor<B>) -> bool {
        let target = wt.weak_ref();
        self.inner
            .bound
            .lock()
            .unwrap()
            .iter()
            .any(|w| Weak::ptr_eq(w, &target))
    }

    /// Whether `wt` is bound to this graph or any ancestor.
    fn chain_is_bound(&self, wt: &WeightTensor<B>) -> bool {
        let mut current = Some(self.clone());
        while let Some(g) = current {
            if g.is_bound(wt) {
                return true;
            }
            current = g.inner.parent.clone();
        }
        false
    }

    /// Number of live bound tensors.
    pub fn bound_count(&self) -> usize {
        self.inner
            .bound
            .lock()
            .unwrap()
            .iter()
            .filter(|w| w.upgrade().is_some())
            .count()
    }

    /// Run backward from a loss tensor and distribute the results.
    ///
    /// The seed is the loss tensor's gradient slot when one was set (via
    /// `fill_gradient` / `copy_weights_to_gradients`); a scalar loss with
    /// no explicit seed starts from 1. Afterwards every live, trainable
    /// tensor bound to this graph pulls its gradient out of the store via
    /// copy-or-add, so sibling consumers' contributions always sum.
    pub fn backward_from(&self, loss: &WeightTensor<B>) -> Result<GradStore<B>> {
        let root = loss.weight()?;
        let store = match loss.gradient()? {
            Some(seed) => backprop::backward_with_seed(&root, &seed)?,
            None => backprop::backward(&root)?,
        };
        self.distribute(&store)?;
        Ok(store)
    }

    /// Copy-or-add gradients from a finished backward pass into every
    /// live trainable tensor bound to this graph.
    pub fn distribute(&self, store: &GradStore<B>) -> Result<()> {
        let bound: Vec<Weak<WeightInner<B>>> = self.inner.bound.lock().unwrap().clone();
        for weak in bound {
            if let Some(inner) = weak.upgrade() {
                let wt = WeightTensor::from_arc(inner);
                if wt.is_trainable() && !wt.is_released() {
                    wt.apply_grads(store)?;
                }
            }
        }
        Ok(())
    }
}

/// RAII guard for a child scope. Dropping it releases every weight tensor
/// bound exclusively to the child; tensors also bound up the parent chain
/// survive.
pub struct SubGraph<B: Backend> {
    graph: Graph<B>,
}

impl<B: Backend> std::ops::Deref for SubGraph<B> {
    type Target = Graph<B>;

    fn deref(&self) -> &Graph<B> {
        &self.graph
    }
}

impl<B: Backend> Drop for SubGraph<B> {
    fn drop(&mut self) {
        // Snapshot and clear first so release → unbind cannot re-enter the
        // lock we hold.
        let bound = std::mem::take(&mut *self.graph.inner.bound.lock().unwrap());
        let parent = self.graph.inner.parent.clone();
        for weak in bound {
            if let Some(inner) = weak.upgrade() {
                let wt = WeightTensor::from_arc(inner);
                let retained = parent
                    .as_ref()
                    .map(|p| p.chain_is_bound(&wt))
                    .unwrap_or(false);
                if !retained {
                    wt.release();
                }
            }
        }
    }
}
