//! Non-owning buffer views.

use crate::element::Element;
use crate::error::{GpuError, GpuResult};

/// A borrowed, optionally strided slice over host-visible buffer memory.
///
/// Never outlives its buffer: the lifetime ties the view to the borrow
/// of the buffer it came from.
#[derive(Debug, Clone, Copy)]
pub struct ArrayView<'a, E: Element> {
    data: &'a [E],
    stride: usize,
}

impl<'a, E: Element> ArrayView<'a, E> {
    pub(crate) fn new(data: &'a [E]) -> Self {
        Self { data, stride: 1 }
    }

    /// Number of addressable elements.
    pub fn len(&self) -> usize {
        if self.stride <= 1 {
            self.data.len()
        } else {
            self.data.len().div_ceil(self.stride)
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stride(&self) -> usize {
        self.stride
    }

    pub fn get(&self, index: usize) -> Option<E> {
        self.data.get(index * self.stride).copied()
    }

    /// Contiguous access; `None` when the view is strided.
    pub fn as_slice(&self) -> Option<&'a [E]> {
        (self.stride <= 1).then_some(self.data)
    }

    pub fn iter(&self) -> impl Iterator<Item = E> + 'a {
        let stride = self.stride.max(1);
        self.data.iter().step_by(stride).copied()
    }

    /// Bounds-checked subview. `offset == len` with `extent == 0` yields
    /// a valid empty view; anything reaching past the end is rejected.
    pub fn subview(&self, offset: usize, extent: usize) -> GpuResult<Self> {
        let len = self.len();
        if offset > len || extent > len - offset.min(len) {
            return Err(GpuError::invalid_argument(format!(
                "subview [{offset}, {offset}+{extent}) exceeds view of length {len}"
            )));
        }
        let stride = self.stride.max(1);
        let start = (offset * stride).min(self.data.len());
        let end = if extent == 0 {
            start
        } else {
            ((offset + extent - 1) * stride + 1).min(self.data.len())
        };
        Ok(Self {
            data: &self.data[start..end.max(start)],
            stride: self.stride,
        })
    }

    /// Re-striding view: element `i` of the result maps to element
    /// `i * step` of this view.
    pub fn with_stride(&self, step: usize) -> GpuResult<Self> {
        if step == 0 {
            return Err(GpuError::invalid_argument("view stride must be nonzero"));
        }
        Ok(Self {
            data: self.data,
            stride: self.stride.max(1) * step,
        })
    }

    /// Copy the view out into a `Vec`.
    pub fn to_vec(&self) -> Vec<E> {
        self.iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subview_boundaries() {
        let data = [0f32, 1.0, 2.0, 3.0];
        let v = ArrayView::new(&data);
        assert_eq!(v.subview(1, 2).unwrap().to_vec(), vec![1.0, 2.0]);
        // offset == len, extent == 0 is valid and empty
        let empty = v.subview(4, 0).unwrap();
        assert!(empty.is_empty());
        // offset == len, extent == 1 is out of bounds
        assert!(v.subview(4, 1).is_err());
        assert!(v.subview(5, 0).is_err());
        assert!(v.subview(2, 3).is_err());
    }

    #[test]
    fn strided_access() {
        let data = [0i32, 1, 2, 3, 4, 5];
        let v = ArrayView::new(&data).with_stride(2).unwrap();
        assert_eq!(v.len(), 3);
        assert_eq!(v.to_vec(), vec![0, 2, 4]);
        assert_eq!(v.get(2), Some(4));
        assert_eq!(v.get(3), None);
        assert!(v.as_slice().is_none());
    }

    #[test]
    fn strided_subview() {
        let data = [0i32, 1, 2, 3, 4, 5, 6, 7];
        let v = ArrayView::new(&data).with_stride(2).unwrap();
        let sub = v.subview(1, 2).unwrap();
        assert_eq!(sub.to_vec(), vec![2, 4]);
    }
}
