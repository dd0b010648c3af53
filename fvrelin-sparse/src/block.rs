use nalgebra::{DMatrix, DMatrixView, DMatrixViewMut, Scalar};
use nalgebra_sparse::pattern::SparsityPattern;
use nalgebra_sparse::CsrMatrix;
use num::Zero;
use std::ops::Range;
use std::sync::Arc;

/// A square matrix stored as dense blocks in compressed block-row format.
///
/// Each stored block is a `block_size x block_size` dense matrix laid out in column-major order,
/// and blocks are stored in the order given by the block sparsity pattern.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCsrMatrix<T> {
    pattern: Arc<SparsityPattern>,
    block_size: usize,
    values: Vec<T>,
}

/// Mutable access to a single block row of a [`BlockCsrMatrix`].
pub struct BlockCsrRowMut<'a, T> {
    block_columns: &'a [usize],
    values: &'a mut [T],
    block_size: usize,
}

fn block_range(block_index: usize, block_size: usize) -> Range<usize> {
    let len = block_size * block_size;
    block_index * len..(block_index + 1) * len
}

impl<T: Scalar + Zero> BlockCsrMatrix<T> {
    /// Creates a zero matrix with the given block pattern.
    ///
    /// # Panics
    ///
    /// Panics if the pattern is not square or if `block_size` is zero.
    pub fn from_pattern(pattern: Arc<SparsityPattern>, block_size: usize) -> Self {
        assert!(block_size >= 1, "Block size must be at least 1.");
        assert_eq!(
            pattern.major_dim(),
            pattern.minor_dim(),
            "Block sparsity pattern must be square."
        );
        let values = vec![T::zero(); pattern.nnz() * block_size * block_size];
        Self {
            pattern,
            block_size,
            values,
        }
    }

    /// Sets every stored entry to the given value. The pattern is left untouched.
    pub fn fill(&mut self, value: T) {
        self.values.fill(value);
    }

    /// Returns the expanded (scalar) matrix in CSR format.
    pub fn to_csr(&self) -> CsrMatrix<T> {
        let b = self.block_size;
        let n = self.nrows();
        let mut row_offsets = Vec::with_capacity(n + 1);
        let mut column_indices = Vec::with_capacity(self.values.len());
        let mut values = Vec::with_capacity(self.values.len());
        row_offsets.push(0);

        for block_row in 0..self.block_rows() {
            let offset = self.pattern.major_offsets()[block_row];
            let block_columns = self.pattern.lane(block_row);
            for r in 0..b {
                for (local_idx, &block_col) in block_columns.iter().enumerate() {
                    let block = &self.values[block_range(offset + local_idx, b)];
                    for c in 0..b {
                        column_indices.push(block_col * b + c);
                        values.push(block[c * b + r].clone());
                    }
                }
                row_offsets.push(column_indices.len());
            }
        }

        CsrMatrix::try_from_csr_data(n, n, row_offsets, column_indices, values)
            .expect("Expanded block pattern is always a valid CSR pattern")
    }

    /// Returns the expanded matrix as a dense matrix.
    pub fn to_dense(&self) -> DMatrix<T> {
        let b = self.block_size;
        let mut dense = DMatrix::zeros(self.nrows(), self.ncols());
        for block_row in 0..self.block_rows() {
            let offset = self.pattern.major_offsets()[block_row];
            for (local_idx, &block_col) in self.pattern.lane(block_row).iter().enumerate() {
                let block = DMatrixView::from_slice(&self.values[block_range(offset + local_idx, b)], b, b);
                dense
                    .view_mut((block_row * b, block_col * b), (b, b))
                    .copy_from(&block);
            }
        }
        dense
    }
}

impl<T> BlockCsrMatrix<T> {
    pub fn pattern(&self) -> &Arc<SparsityPattern> {
        &self.pattern
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Number of block rows, i.e. the number of degrees of freedom.
    pub fn block_rows(&self) -> usize {
        self.pattern.major_dim()
    }

    /// Number of scalar rows.
    pub fn nrows(&self) -> usize {
        self.block_rows() * self.block_size
    }

    /// Number of scalar columns.
    pub fn ncols(&self) -> usize {
        self.pattern.minor_dim() * self.block_size
    }

    /// Number of explicitly stored blocks.
    pub fn nnz_blocks(&self) -> usize {
        self.pattern.nnz()
    }

    /// All stored block values, block after block.
    pub fn values(&self) -> &[T] {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut [T] {
        &mut self.values
    }

    /// Returns the index of the stored block at `(row, col)`, if it is part of the pattern.
    pub fn find_block_index(&self, row: usize, col: usize) -> Option<usize> {
        let begin = *self.pattern.major_offsets().get(row)?;
        let end = *self.pattern.major_offsets().get(row + 1)?;
        self.pattern.minor_indices()[begin..end]
            .binary_search(&col)
            .ok()
            .map(|local_idx| begin + local_idx)
    }

    /// Returns mutable access to the given block row.
    ///
    /// # Panics
    ///
    /// Panics if the row index is out of bounds.
    pub fn row_mut(&mut self, row: usize) -> BlockCsrRowMut<T> {
        assert!(row < self.block_rows(), "Block row index out of bounds.");
        let begin = self.pattern.major_offsets()[row];
        let end = self.pattern.major_offsets()[row + 1];
        let b2 = self.block_size * self.block_size;
        BlockCsrRowMut {
            block_columns: &self.pattern.minor_indices()[begin..end],
            values: &mut self.values[begin * b2..end * b2],
            block_size: self.block_size,
        }
    }
}

impl<T: Scalar> BlockCsrMatrix<T> {
    /// Returns a view of the block at `(row, col)`, or `None` if the block is not stored.
    pub fn block(&self, row: usize, col: usize) -> Option<DMatrixView<T>> {
        let k = self.find_block_index(row, col)?;
        let b = self.block_size;
        Some(DMatrixView::from_slice(&self.values[block_range(k, b)], b, b))
    }

    /// Returns a mutable view of the block at `(row, col)`, or `None` if the block is not stored.
    pub fn block_mut(&mut self, row: usize, col: usize) -> Option<DMatrixViewMut<T>> {
        let k = self.find_block_index(row, col)?;
        let b = self.block_size;
        Some(DMatrixViewMut::from_slice(&mut self.values[block_range(k, b)], b, b))
    }

    pub fn diagonal_block(&self, row: usize) -> Option<DMatrixView<T>> {
        self.block(row, row)
    }

    pub fn diagonal_block_mut(&mut self, row: usize) -> Option<DMatrixViewMut<T>> {
        self.block_mut(row, row)
    }
}

impl<'a, T> BlockCsrRowMut<'a, T> {
    pub fn block_columns(&self) -> &[usize] {
        self.block_columns
    }

    pub fn nnz_blocks(&self) -> usize {
        self.block_columns.len()
    }

    /// Sets every entry of every block in the row to the given value.
    pub fn fill(&mut self, value: T)
    where
        T: Clone,
    {
        self.values.fill(value);
    }
}

impl<'a, T: Scalar> BlockCsrRowMut<'a, T> {
    /// Returns the block associated with the given (global) block column,
    /// or `None` if the row does not store it.
    pub fn block_mut(&mut self, block_col: usize) -> Option<DMatrixViewMut<T>> {
        let local_idx = self.block_columns.binary_search(&block_col).ok()?;
        Some(self.local_block_mut(local_idx))
    }

    /// Returns the `local_idx`-th stored block of the row.
    pub fn local_block_mut(&mut self, local_idx: usize) -> DMatrixViewMut<T> {
        let b = self.block_size;
        DMatrixViewMut::from_slice(&mut self.values[block_range(local_idx, b)], b, b)
    }
}
