// End-to-end engine tests: indexing-op algebra, weight-tensor lifecycle,
// subgraph scoping, autograd correctness against finite differences, and
// the store boundary.

use stoat::prelude::*;
use stoat_cpu::{CpuBackend, CpuDevice};

type T = Tensor<CpuBackend>;
type Wt = WeightTensor<CpuBackend>;

fn dev() -> CpuDevice {
    CpuDevice::default()
}

// Indexing-op algebra

#[test]
fn gather_then_scatter_reproduces_source_positions() {
    let d = dev();
    let src = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (2, 3), DType::F64, &d).unwrap();
    let idx = T::from_f64_slice(&[0.0, 2.0, 1.0, 0.0], (2, 2), DType::F64, &d).unwrap();

    let gathered = src.gather(1, &idx).unwrap();
    let zeros = T::zeros((2, 3), DType::F64, &d).unwrap();
    let back = zeros.scatter(1, &idx, &gathered).unwrap();

    // Gathered positions carry the source values, everything else stays 0.
    assert_eq!(back.to_f64_vec().unwrap(), vec![1.0, 0.0, 3.0, 4.0, 5.0, 0.0]);
}

#[test]
fn scatter_add_is_linear_over_repeated_indices() {
    let d = dev();
    let zeros = T::zeros((1, 4), DType::F64, &d).unwrap();
    let idx = T::from_f64_slice(&[2.0, 2.0], (1, 2), DType::F64, &d).unwrap();

    // Scattering v twice to one slot equals scattering 2v once.
    let v = T::from_f64_slice(&[3.0, 3.0], (1, 2), DType::F64, &d).unwrap();
    let twice = zeros.scatter_add(1, &idx, &v).unwrap();
    assert_eq!(twice.to_f64_vec().unwrap(), vec![0.0, 0.0, 6.0, 0.0]);

    let idx_once = T::from_f64_slice(&[2.0], (1, 1), DType::F64, &d).unwrap();
    let v2 = T::from_f64_slice(&[6.0], (1, 1), DType::F64, &d).unwrap();
    let once = zeros.scatter_add(1, &idx_once, &v2).unwrap();
    assert_eq!(once.to_f64_vec().unwrap(), twice.to_f64_vec().unwrap());
}

#[test]
fn scatter_overwrite_differs_from_accumulate() {
    let d = dev();
    let base = T::ones((1, 3), DType::F64, &d).unwrap();
    let idx = T::from_f64_slice(&[1.0], (1, 1), DType::F64, &d).unwrap();
    let v = T::from_f64_slice(&[5.0], (1, 1), DType::F64, &d).unwrap();

    assert_eq!(
        base.scatter(1, &idx, &v).unwrap().to_f64_vec().unwrap(),
        vec![1.0, 5.0, 1.0]
    );
    assert_eq!(
        base.scatter_add(1, &idx, &v).unwrap().to_f64_vec().unwrap(),
        vec![1.0, 6.0, 1.0]
    );
}

#[test]
fn index_ops_reject_shape_violations() {
    let d = dev();
    let a = T::zeros((2, 3), DType::F64, &d).unwrap();
    // Rank mismatch.
    let idx1 = T::zeros(2, DType::I64, &d).unwrap();
    assert!(a.gather(1, &idx1).is_err());
    // Non-target axis disagrees.
    let idx2 = T::zeros((3, 1), DType::I64, &d).unwrap();
    assert!(a.gather(1, &idx2).is_err());
    // Target dim out of range.
    let idx3 = T::zeros((2, 1), DType::I64, &d).unwrap();
    assert!(a.gather(5, &idx3).is_err());
    // index_select past the end.
    assert!(a.index_select(0, &[7]).is_err());
}

// Weight-tensor lifecycle

#[test]
fn double_assignment_names_the_previous_setter() {
    let d = dev();
    let wt = Wt::constant("enc.w", (2, 2), 1.0, DType::F32, &d, true).unwrap();
    let fresh = T::zeros((2, 2), DType::F32, &d).unwrap();
    let err = wt.set_weight(fresh, "test").unwrap_err();
    let msg = err.to_string();
    assert!(msg.contains("enc.w"), "{msg}");
    assert!(msg.contains("construction"), "{msg}");
}

#[test]
fn released_weight_fails_all_access_by_name() {
    let d = dev();
    let wt = Wt::constant("dec.b", 4, 0.0, DType::F32, &d, false).unwrap();
    wt.release();
    wt.release(); // idempotent

    let err = wt.weight().unwrap_err();
    assert!(err.to_string().contains("dec.b"));
    assert!(wt.gradient().is_err());
    assert!(wt.fill_gradient(1.0).is_err());
    assert!(wt.to_weight_array().is_err());
}

#[test]
fn gradient_allocates_lazily_and_zero_filled() {
    let d = dev();
    let wt = Wt::constant("w", (2, 3), 7.0, DType::F64, &d, true).unwrap();
    assert!(wt.gradient().unwrap().is_none());
    let g = wt.grad_or_init().unwrap();
    assert_eq!(g.to_f64_vec().unwrap(), vec![0.0; 6]);
}

#[test]
fn copy_or_add_second_call_accumulates() {
    let d = dev();
    let src = Wt::constant("src", 3, 0.0, DType::F64, &d, false).unwrap();
    src.fill_gradient(1.5).unwrap();

    let dst = Wt::constant("dst", 3, 0.0, DType::F64, &d, true).unwrap();
    dst.copy_or_add_gradient(&src).unwrap();
    assert_eq!(
        dst.gradient().unwrap().unwrap().to_f64_vec().unwrap(),
        vec![1.5; 3]
    );
    // Second call adds; it must not overwrite back to 1.5.
    dst.copy_or_add_gradient(&src).unwrap();
    assert_eq!(
        dst.gradient().unwrap().unwrap().to_f64_vec().unwrap(),
        vec![3.0; 3]
    );
}

#[test]
fn add_gradient_from_tolerates_aliasing() {
    let d = dev();
    let wt = Wt::constant("w", 2, 0.0, DType::F64, &d, true).unwrap();
    wt.fill_gradient(2.0).unwrap();
    // Accumulating a tensor's own gradient into itself must double it, not
    // deadlock or corrupt.
    wt.add_gradient_from(&wt).unwrap();
    assert_eq!(
        wt.gradient().unwrap().unwrap().to_f64_vec().unwrap(),
        vec![4.0, 4.0]
    );
}

#[test]
fn gradient_shape_mismatch_is_rejected() {
    let d = dev();
    let wt = Wt::constant("w", (2, 2), 0.0, DType::F64, &d, true).unwrap();
    let wrong = T::ones((3, 3), DType::F64, &d).unwrap();
    let err = wt.copy_or_add_gradient_tensor(&wrong).unwrap_err();
    assert!(err.to_string().contains('w'));
}

#[test]
fn weight_aliases_share_mutation() {
    // The gradient slot set through copy_weights_to_gradients aliases the
    // source's weight storage: updates through either side are visible to
    // both (reference sharing, not copy-on-write).
    let d = dev();
    let value = Wt::constant("fwd", 4, 2.0, DType::F64, &d, false).unwrap();
    let seed = Wt::constant("loss", 4, 0.0, DType::F64, &d, false).unwrap();
    // seed's gradient slot must be empty for the alias assignment; it is.
    seed.copy_weights_to_gradients(&value).unwrap();

    value
        .weight()
        .unwrap()
        .update_data_inplace(&[9.0, 9.0, 9.0, 9.0])
        .unwrap();
    assert_eq!(
        seed.gradient().unwrap().unwrap().to_f64_vec().unwrap(),
        vec![9.0; 4]
    );
}

#[test]
fn top_weight_indices_orders_descending() {
    let d = dev();
    let wt = Wt::constant("w", 5, 0.0, DType::F64, &d, false).unwrap();
    wt.weight()
        .unwrap()
        .update_data_inplace(&[0.1, 5.0, -2.0, 3.0, 4.5])
        .unwrap();
    assert_eq!(wt.top_weight_indices(3).unwrap(), vec![1, 4, 3]);
    // Asking for more than available clamps.
    assert_eq!(wt.top_weight_indices(99).unwrap().len(), 5);
}

// Subgraph scoping

#[test]
fn subgraph_drop_releases_exclusive_tensors_only() {
    let d = dev();
    let root = Graph::<CpuBackend>::root();
    let kept = Wt::activation("kept", (2, 2), DType::F64, &d, Some(&root)).unwrap();

    let temp_handle;
    {
        let step = root.subgraph("step0");
        let temp = Wt::activation("temp", (2, 2), DType::F64, &d, Some(&*step)).unwrap();
        temp_handle = temp.clone();
        step.bind(&kept); // also bound to root → must survive
        assert!(temp.weight().is_ok());
        assert!(step.is_bound(&temp));
    }

    // The exclusive temporary is gone, the parent-bound tensor lives.
    assert!(temp_handle.weight().is_err());
    assert!(kept.weight().is_ok());
}

#[test]
fn unbind_prevents_scope_release() {
    let d = dev();
    let root = Graph::<CpuBackend>::root();
    let survivor;
    {
        let step = root.subgraph("step");
        let wt = Wt::activation("t", 4, DType::F64, &d, Some(&*step)).unwrap();
        survivor = wt.clone();
        wt.unbind();
    }
    assert!(survivor.weight().is_ok());
}

#[test]
fn released_buffers_return_to_the_pool() {
    let d = dev();
    let before = d.pool().stats().cached_buffers;
    let wt = Wt::constant("w", 64, 1.0, DType::F32, &d, false).unwrap();
    wt.release();
    let after = d.pool().stats().cached_buffers;
    assert!(after > before, "release did not recycle ({before} → {after})");
}

// Autograd

#[test]
fn shared_consumer_gradients_sum() {
    // y = x ⊙ x consumes x twice; dy/dx = 2x must come out of the two
    // accumulated contributions.
    let d = dev();
    let x = T::from_f64_slice(&[1.0, -2.0, 3.0], 3, DType::F64, &d)
        .unwrap()
        .set_variable();
    let y = x.mul(&x).unwrap();
    let loss = y.sum_all().unwrap();
    let grads = backward(&loss).unwrap();
    let gx = grads.get(&x).unwrap().to_f64_vec().unwrap();
    assert_eq!(gx, vec![2.0, -4.0, 6.0]);
}

#[test]
fn matmul_tanh_gradients_match_finite_differences() {
    let d = dev();
    let x_data = [0.3, -0.2, 0.8, 0.5, -0.6, 0.1];
    let w_data = [0.2, -0.4, 0.7, 0.05, -0.3, 0.6];

    let forward = |w_vals: &[f64]| -> f64 {
        let x = T::from_f64_slice(&x_data, (2, 3), DType::F64, &d).unwrap();
        let w = T::from_f64_slice(w_vals, (3, 2), DType::F64, &d).unwrap();
        let y = x.matmul(&w).unwrap().tanh().unwrap().square().unwrap();
        y.sum_all().unwrap().scalar_value().unwrap()
    };

    // Autograd gradient.
    let x = T::from_f64_slice(&x_data, (2, 3), DType::F64, &d).unwrap();
    let w = T::from_f64_slice(&w_data, (3, 2), DType::F64, &d)
        .unwrap()
        .set_variable();
    let loss = x
        .matmul(&w)
        .unwrap()
        .tanh()
        .unwrap()
        .square()
        .unwrap()
        .sum_all()
        .unwrap();
    let grads = backward(&loss).unwrap();
    let gw = grads.get(&w).unwrap().to_f64_vec().unwrap();

    // Central differences.
    let eps = 1e-5;
    for i in 0..w_data.len() {
        let mut plus = w_data.to_vec();
        plus[i] += eps;
        let mut minus = w_data.to_vec();
        minus[i] -= eps;
        let numeric = (forward(&plus) - forward(&minus)) / (2.0 * eps);
        assert!(
            (gw[i] - numeric).abs() < 1e-6,
            "grad[{i}]: autograd {} vs numeric {numeric}",
            gw[i]
        );
    }
}

#[test]
fn index_select_gradient_lands_on_selected_rows() {
    let d = dev();
    let x = T::from_f64_slice(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], (3, 2), DType::F64, &d)
        .unwrap()
        .set_variable();
    // Row 1 selected twice: its gradient must double.
    let picked = x.index_select(0, &[1, 1, 2]).unwrap();
    let loss = picked.sum_all().unwrap();
    let grads = backward(&loss).unwrap();
    let gx = grads.get(&x).unwrap().to_f64_vec().unwrap();
    assert_eq!(gx, vec![0.0, 0.0, 2.0, 2.0, 1.0, 1.0]);
}

#[test]
fn fused_mul_mul_add_gradients() {
    let d = dev();
    let a = T::from_f64_slice(&[1.0, 2.0], 2, DType::F64, &d)
        .unwrap()
        .set_variable();
    let b = T::from_f64_slice(&[3.0, 4.0], 2, DType::F64, &d)
        .unwrap()
        .set_variable();
    let c = T::from_f64_slice(&[5.0, 6.0], 2, DType::F64, &d)
        .unwrap()
        .set_variable();
    let e = T::from_f64_slice(&[7.0, 8.0], 2, DType::F64, &d)
        .unwrap()
        .set_variable();
    let y = a.mul_mul_add(&b, &c, &e).unwrap();
    let grads = backward(&y.sum_all().unwrap()).unwrap();
    assert_eq!(grads.get(&a).unwrap().to_f64_vec().unwrap(), vec![3.0, 4.0]);
    assert_eq!(grads.get(&b).unwrap().to_f64_vec().unwrap(), vec![1.0, 2.0]);
    assert_eq!(grads.get(&c).unwrap().to_f64_vec().unwrap(), vec![7.0, 8.0]);
    assert_eq!(grads.get(&e).unwrap().to_f64_vec().unwrap(), vec![5.0, 6.0]);
}

#[test]
fn graph_backward_distributes_into_bound_weights() {
    let d = dev();
    let graph = Graph::<CpuBackend>::root();
    let w = Wt::trainable(
        "proj",
        (3, 2),
        DType::F64,
        &d,
        NormType::Uniform,
        Some(3),
        Some(2),
    )
    .unwrap();
    graph.bind(&w);

    let x = T::from_f64_slice(&[1.0, 0.0, -1.0, 0.5, 2.0, 1.5], (2, 3), DType::F64, &d).unwrap();
    let y = x.matmul(&w.weight().unwrap()).unwrap();
    let loss = Wt::from_tensor("loss", y.sum_all().unwrap());
    loss.fill_gradient(1.0).unwrap();

    graph.backward_from(&loss).unwrap();

    // d(sum(x@w))/dw = xᵀ @ ones.
    let g = w.gradient().unwrap().unwrap().to_f64_vec().unwrap();
    let expect = [1.5, 1.5, 2.0, 2.0, 0.5, 0.5];
    for (a, e) in g.iter().zip(expect.iter()) {
        assert!((a - e).abs() < 1e-12, "{g:?}");
    }
}

#[test]
fn one_descent_step_reduces_loss() {
    let d = dev();
    let x = T::from_f64_slice(&[0.5, -1.0, 2.0, 1.0, 0.0, -0.5], (3, 2), DType::F64, &d).unwrap();
    let target = T::from_f64_slice(&[1.0, -1.0, 0.5], (3, 1), DType::F64, &d).unwrap();
    let w = T::from_f64_slice(&[0.1, 0.1], (2, 1), DType::F64, &d)
        .unwrap()
        .set_variable();

    let loss_of = |w: &T| -> (f64, T) {
        let err = x.matmul(w).unwrap().sub(&target).unwrap();
        let loss = err.square().unwrap().sum_all().unwrap();
        (loss.scalar_value().unwrap(), loss)
    };

    let (before, loss) = loss_of(&w);
    let grads = backward(&loss).unwrap();
    let gw = grads.get(&w).unwrap().to_f64_vec().unwrap();

    let lr = 0.05;
    let stepped: Vec<f64> = w
        .to_f64_vec()
        .unwrap()
        .iter()
        .zip(gw.iter())
        .map(|(wi, gi)| wi - lr * gi)
        .collect();
    w.update_data_inplace(&stepped).unwrap();

    let (after, _) = loss_of(&w);
    assert!(after < before, "loss went {before} → {after}");
}

// Store boundary

#[test]
fn weight_tensor_save_load_through_store() {
    let d = dev();
    let mut store = ModelStore::new(QuantMode::None);
    let original = Wt::constant("enc.w", (2, 2), 0.0, DType::F32, &d, true).unwrap();
    original
        .weight()
        .unwrap()
        .update_data_inplace(&[1.0, 2.0, 3.0, 4.0])
        .unwrap();
    original.save(&mut store).unwrap();

    let restored = Wt::constant("enc.w", (2, 2), 0.0, DType::F32, &d, true).unwrap();
    assert!(restored.load(&store).unwrap());
    assert_eq!(
        restored.weight().unwrap().to_f64_vec().unwrap(),
        vec![1.0, 2.0, 3.0, 4.0]
    );

    // Absent names load nothing and leave the buffer untouched.
    let missing = Wt::constant("ghost", (2, 2), 9.0, DType::F32, &d, true).unwrap();
    assert!(!missing.load(&store).unwrap());
    assert_eq!(
        missing.weight().unwrap().to_f64_vec().unwrap(),
        vec![9.0; 4]
    );
}

#[test]
fn layer_save_load_through_store() {
    let d = dev();
    let mut store = ModelStore::new(QuantMode::None);
    let ln = LayerNorm::<CpuBackend>::new("blk.ln", 4, 1e-5, DType::F32, &d).unwrap();
    ln.params()[0]
        .weight()
        .unwrap()
        .update_data_inplace(&[2.0, 2.0, 2.0, 2.0])
        .unwrap();
    ln.save(&mut store).unwrap();

    let ln2 = LayerNorm::<CpuBackend>::new("blk.ln", 4, 1e-5, DType::F32, &d).unwrap();
    assert_eq!(ln2.load(&store).unwrap(), 2);
    assert_eq!(
        ln2.params()[0].weight().unwrap().to_f64_vec().unwrap(),
        vec![2.0; 4]
    );
}
