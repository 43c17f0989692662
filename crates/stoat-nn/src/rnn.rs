// LSTM cells — plain and attention-augmented.
//
// Gate weights are packed: one [input, 4·hidden] input projection and one
// [hidden, 4·hidden] recurrent projection, split four ways after the two
// matmuls. Column order is input / forget / cell / output.
//
//   gates = x·W_ih + h·W_hh + b
//   i, f, g, o = split(gates)
//   c' = σ(f)⊙c + σ(i)⊙tanh(g)      (one fused mul_mul_add pass)
//   h' = σ(o)⊙tanh(c')
//
// The unroller opens one named subgraph per timestep and binds the step's
// gate activation to it, so the temporary is released the moment the step
// scope closes.

use stoat_core::backend::Backend;
use stoat_core::dtype::DType;
use stoat_core::error::{Error, Result};
use stoat_core::graph::Graph;
use stoat_core::tensor::Tensor;
use stoat_core::weight::{NormType, WeightTensor};

use crate::module::Module;

/// Single-step LSTM cell with packed gate weights.
pub struct LstmCell<B: Backend> {
    /// [input_size, 4·hidden]
    w_ih: WeightTensor<B>,
    /// [hidden, 4·hidden]
    w_hh: WeightTensor<B>,
    /// [1, 4·hidden], zero-initialized.
    bias: WeightTensor<B>,
    pub input_size: usize,
    pub hidden_size: usize,
}

impl<B: Backend> LstmCell<B> {
    pub fn new(
        name: &str,
        input_size: usize,
        hidden_size: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let w_ih = WeightTensor::trainable(
            format!("{name}.w_ih"),
            (input_size, 4 * hidden_size),
            dtype,
            device,
            NormType::Uniform,
            Some(input_size),
            Some(4 * hidden_size),
        )?;
        let w_hh = WeightTensor::trainable(
            format!("{name}.w_hh"),
            (hidden_size, 4 * hidden_size),
            dtype,
            device,
            NormType::Uniform,
            Some(hidden_size),
            Some(4 * hidden_size),
        )?;
        let bias = WeightTensor::constant(
            format!("{name}.bias"),
            (1, 4 * hidden_size),
            0.0,
            dtype,
            device,
            true,
        )?;
        Ok(LstmCell {
            w_ih,
            w_hh,
            bias,
            input_size,
            hidden_size,
        })
    }

    /// One step: `x` [batch, input], `h`/`c` [batch, hidden] →
    /// (h', c'). Returns the new hidden and cell state.
    pub fn forward(
        &self,
        x: &Tensor<B>,
        h: &Tensor<B>,
        c: &Tensor<B>,
    ) -> Result<(Tensor<B>, Tensor<B>)> {
        let (_, next) = self.forward_with_gates(x, h, c)?;
        Ok(next)
    }

    /// Like [`forward`](Self::forward) but also returns the raw gate
    /// pre-activation so the caller can bind it to a step scope.
    pub fn forward_with_gates(
        &self,
        x: &Tensor<B>,
        h: &Tensor<B>,
        c: &Tensor<B>,
    ) -> Result<(Tensor<B>, (Tensor<B>, Tensor<B>))> {
        let gates = x
            .matmul(&self.w_ih.weight()?)?
            .add(&h.matmul(&self.w_hh.weight()?)?)?
            .add(&self.bias.weight()?)?;

        let parts = gates.split_cols_even(4)?;
        let i = parts[0].sigmoid()?;
        let f = parts[1].sigmoid()?;
        let g = parts[2].tanh()?;
        let o = parts[3].sigmoid()?;

        // c' = f⊙c + i⊙g, fused.
        let c_next = f.mul_mul_add(c, &i, &g)?;
        let h_next = o.mul(&c_next.tanh()?)?;
        Ok((gates, (h_next, c_next)))
    }
}

impl<B: Backend> Module<B> for LstmCell<B> {
    fn params(&self) -> Vec<WeightTensor<B>> {
        vec![self.w_ih.clone(), self.w_hh.clone(), self.bias.clone()]
    }
}

/// LSTM unrolled over a [batch, seq, input] sequence.
pub struct Lstm<B: Backend> {
    cell: LstmCell<B>,
    name: String,
}

impl<B: Backend> Lstm<B> {
    pub fn new(
        name: &str,
        input_size: usize,
        hidden_size: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        let cell = LstmCell::new(name, input_size, hidden_size, dtype, device)?;
        Ok(Lstm {
            cell,
            name: name.to_string(),
        })
    }

    pub fn cell(&self) -> &LstmCell<B> {
        &self.cell
    }

    /// Run the whole sequence. Returns all hidden states
    /// [batch, seq, hidden] plus the final (h, c).
    ///
    /// Each timestep runs inside its own subgraph of `graph`; the step's
    /// gate activation is bound there and released when the step ends.
    pub fn forward(
        &self,
        graph: &Graph<B>,
        x: &Tensor<B>,
        state: Option<(Tensor<B>, Tensor<B>)>,
    ) -> Result<(Tensor<B>, (Tensor<B>, Tensor<B>))> {
        if x.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: x.rank(),
            });
        }
        let (batch, seq_len) = (x.dims()[0], x.dims()[1]);
        let hidden = self.cell.hidden_size;

        let (mut h, mut c) = match state {
            Some(s) => s,
            None => (
                Tensor::<B>::zeros((batch, hidden), x.dtype(), x.device())?,
                Tensor::<B>::zeros((batch, hidden), x.dtype(), x.device())?,
            ),
        };

        let mut outputs = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let step = graph.subgraph(format!("{}.t{t}", self.name));
            let x_t = x.narrow(1, t, 1)?.reshape((batch, self.cell.input_size))?;
            let (gates, (h_next, c_next)) = self.cell.forward_with_gates(&x_t, &h, &c)?;

            // The gate tensor is a pure step-local temporary.
            let gates_slot =
                WeightTensor::from_tensor(format!("{}.gates.t{t}", self.name), gates);
            step.bind(&gates_slot);

            h = h_next;
            c = c_next;
            outputs.push(h.reshape((batch, 1, hidden))?);
            // `step` drops here and releases the bound gate slot.
        }

        let all = Tensor::cat(&outputs, 1)?;
        Ok((all, (h, c)))
    }
}

impl<B: Backend> Module<B> for Lstm<B> {
    fn params(&self) -> Vec<WeightTensor<B>> {
        self.cell.params()
    }
}

// Attention LSTM cell — additive (concat) attention over encoder outputs.
//
//   score(b, s) = vᵀ · tanh(enc[b,s]·W_enc + h[b]·W_dec)
//   weights = softmax(score + mask)
//   context[b] = Σ_s weights[b,s] · enc[b,s]
//   step input = [x ; context]

/// LSTM cell that attends over encoder outputs before each step.
pub struct LstmAttentionCell<B: Backend> {
    cell: LstmCell<B>,
    /// [enc_dim, attn_dim]
    w_enc: WeightTensor<B>,
    /// [hidden, attn_dim]
    w_dec: WeightTensor<B>,
    /// [attn_dim, 1]
    v_att: WeightTensor<B>,
    pub enc_dim: usize,
    pub attn_dim: usize,
}

impl<B: Backend> LstmAttentionCell<B> {
    pub fn new(
        name: &str,
        input_size: usize,
        hidden_size: usize,
        enc_dim: usize,
        attn_dim: usize,
        dtype: DType,
        device: &B::Device,
    ) -> Result<Self> {
        // The cell consumes the token embedding concatenated with the
        // attention context.
        let cell = LstmCell::new(name, input_size + enc_dim, hidden_size, dtype, device)?;
        let w_enc = WeightTensor::trainable(
            format!("{name}.w_enc"),
            (enc_dim, attn_dim),
            dtype,
            device,
            NormType::Uniform,
            Some(enc_dim),
            Some(attn_dim),
        )?;
        let w_dec = WeightTensor::trainable(
            format!("{name}.w_dec"),
            (hidden_size, attn_dim),
            dtype,
            device,
            NormType::Uniform,
            Some(hidden_size),
            Some(attn_dim),
        )?;
        let v_att = WeightTensor::trainable(
            format!("{name}.v_att"),
            (attn_dim, 1),
            dtype,
            device,
            NormType::Uniform,
            Some(attn_dim),
            None,
        )?;
        Ok(LstmAttentionCell {
            cell,
            w_enc,
            w_dec,
            v_att,
            enc_dim,
            attn_dim,
        })
    }

    /// One attended step.
    ///
    /// - `x` [batch, input], `h`/`c` [batch, hidden]
    /// - `enc` [batch, src_len, enc_dim]
    /// - `mask` optional additive mask [batch, src_len] (0 visible, large
    ///   negative blocked), built from source lengths
    ///
    /// Returns (h', c', attention weights [batch, src_len]).
    pub fn forward(
        &self,
        x: &Tensor<B>,
        h: &Tensor<B>,
        c: &Tensor<B>,
        enc: &Tensor<B>,
        mask: Option<&Tensor<B>>,
    ) -> Result<(Tensor<B>, Tensor<B>, Tensor<B>)> {
        if enc.rank() != 3 {
            return Err(Error::RankMismatch {
                expected: 3,
                got: enc.rank(),
            });
        }
        let (batch, src_len) = (enc.dims()[0], enc.dims()[1]);

        // enc·W_enc: flatten the batch and length axes for one matmul.
        let enc_flat = enc.reshape((batch * src_len, self.enc_dim))?;
        let enc_proj = enc_flat
            .matmul(&self.w_enc.weight()?)?
            .reshape((batch, src_len, self.attn_dim))?;

        // h·W_dec, broadcast over source positions.
        let dec_proj = h.matmul(&self.w_dec.weight()?)?.unsqueeze(1)?;

        let scores = enc_proj
            .add(&dec_proj)?
            .tanh()?
            .reshape((batch * src_len, self.attn_dim))?
            .matmul(&self.v_att.weight()?)?
            .reshape((batch, src_len))?;

        let scores = match mask {
            Some(m) => scores.add(m)?,
            None => scores,
        };
        let weights = scores.softmax(1)?;

        // context = weights @ enc, batched: [b,1,s] @ [b,s,e] → [b,1,e].
        let context = weights
            .reshape((batch, 1, src_len))?
            .matmul(enc)?
            .reshape((batch, self.enc_dim))?;

        let step_in = Tensor::cat(&[x.clone(), context], 1)?;
        let (h_next, c_next) = self.cell.forward(&step_in, h, c)?;
        Ok((h_next, c_next, weights))
    }
}

impl<B: Backend> Module<B> for LstmAttentionCell<B> {
    fn params(&self) -> Vec<WeightTensor<B>> {
        let mut params = self.cell.params();
        params.push(self.w_enc.clone());
        params.push(self.w_dec.clone());
        params.push(self.v_att.clone());
        params
    }
}
