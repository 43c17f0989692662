use std::fmt;

// Shape — the ordered dimension sizes of a tensor.
//
// Dimensionality is fixed at creation; two tensors are "the same size" iff
// their shapes match elementwise. A scalar is rank 0 with one element.

/// Ordered dimension sizes of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total element count; a rank-0 scalar counts as 1.
    pub fn elem_count(&self) -> usize {
        self.0.iter().product::<usize>().max(1)
    }

    /// Row-major (C-order) strides: the last dimension is contiguous.
    ///
    /// [2, 3, 4] → [12, 4, 1].
    pub fn stride_contiguous(&self) -> Vec<usize> {
        let rank = self.rank();
        let mut strides = vec![0usize; rank];
        if rank > 0 {
            strides[rank - 1] = 1;
            for i in (0..rank - 1).rev() {
                strides[i] = strides[i + 1] * self.0[i + 1];
            }
        }
        strides
    }

    pub fn dim(&self, d: usize) -> crate::Result<usize> {
        self.0.get(d).copied().ok_or(crate::Error::DimOutOfRange {
            dim: d,
            rank: self.rank(),
        })
    }

    /// NumPy-style broadcast of two shapes, aligned from the trailing dim.
    ///
    /// Per (right-aligned) axis, sizes are compatible when equal or when one
    /// of them is 1; missing leading dims count as 1.
    pub fn broadcast_with(&self, rhs: &Shape) -> crate::Result<Shape> {
        let l = self.dims();
        let r = rhs.dims();
        let rank = l.len().max(r.len());
        let mut out = Vec::with_capacity(rank);
        for i in 0..rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };
            if ld == rd || rd == 1 {
                out.push(ld);
            } else if ld == 1 {
                out.push(rd);
            } else {
                return Err(crate::Error::msg(format!(
                    "shapes {l:?} and {r:?} do not broadcast (axis {i} from right: {ld} vs {rd})"
                )));
            }
        }
        out.reverse();
        Ok(Shape::new(out))
    }

    /// Strides of this shape when broadcast up to `target`: axes of size 1
    /// (and missing leading axes) get stride 0, repeating the element.
    pub fn broadcast_strides(&self, target: &Shape) -> Vec<usize> {
        let own = self.dims();
        let tgt = target.dims();
        let own_strides = self.stride_contiguous();
        let mut out = vec![0usize; tgt.len()];
        let offset = tgt.len() - own.len();
        for i in 0..own.len() {
            if own[i] == tgt[i + offset] {
                out[i + offset] = own_strides[i];
            }
            // own[i] == 1: stride stays 0
        }
        out
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((a, b): (usize, usize)) -> Self {
        Shape(vec![a, b])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((a, b, c): (usize, usize, usize)) -> Self {
        Shape(vec![a, b, c])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((a, b, c, d): (usize, usize, usize, usize)) -> Self {
        Shape(vec![a, b, c, d])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar() {
        let s = Shape::from(());
        assert_eq!(s.rank(), 0);
        assert_eq!(s.elem_count(), 1);
        assert!(s.stride_contiguous().is_empty());
    }

    #[test]
    fn row_major_strides() {
        assert_eq!(Shape::from((2, 3, 4)).stride_contiguous(), vec![12, 4, 1]);
        assert_eq!(Shape::from((3, 4)).stride_contiguous(), vec![4, 1]);
    }

    #[test]
    fn broadcast() {
        let a = Shape::from((3, 4));
        let b = Shape::from(4);
        assert_eq!(a.broadcast_with(&b).unwrap().dims(), &[3, 4]);

        let a = Shape::from((2, 1));
        let b = Shape::from((1, 3));
        assert_eq!(a.broadcast_with(&b).unwrap().dims(), &[2, 3]);

        assert!(Shape::from(3).broadcast_with(&Shape::from(4)).is_err());
    }

    #[test]
    fn broadcast_strides_zero_on_expanded() {
        let a = Shape::from((2, 1));
        let t = Shape::from((2, 3));
        assert_eq!(a.broadcast_strides(&t), vec![1, 0]);

        let b = Shape::from(3);
        let t = Shape::from((2, 3));
        assert_eq!(b.broadcast_strides(&t), vec![0, 1]);
    }
}
