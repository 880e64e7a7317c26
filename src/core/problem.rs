//! The sparse least-squares problem: parameter blocks, residual blocks,
//! and parallel residual/Jacobian assembly.
//!
//! Parameter blocks are registered up front and referenced by id; residual
//! blocks bind a factor, an optional robust loss, and an ordered list of
//! parameter blocks. Residual addition order is deterministic and fixes
//! the row order of the assembled system, which downstream residual
//! reports rely on.
//!
//! Blocks marked as points (triangulated ground points) are ordered after
//! all pose blocks in the column layout, so the linear solvers can
//! marginalize them out through a Schur complement.

use faer::sparse::{SparseColMat, Triplet};
use faer::Mat;
use nalgebra::DVector;
use rayon::prelude::*;

use crate::error::{JitterError, JitterResult};

use super::factor::Factor;
use super::loss::{Corrector, Loss};

/// Identifier of a parameter block within a [`Problem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub(crate) usize);

struct ParamBlock {
    values: DVector<f64>,
    fixed: bool,
    point: bool,
}

struct ResidualBlock {
    factor: Box<dyn Factor>,
    loss: Option<Box<dyn Loss>>,
    params: Vec<BlockId>,
    row_start: usize,
    dim: usize,
}

/// Column layout of the free parameters: pose columns first, then point
/// columns, fixed and unreferenced blocks excluded.
pub struct Layout {
    col_of_block: Vec<Option<usize>>,
    pub num_cols: usize,
    pub camera_dof: usize,
    pub point_dof: usize,
}

impl Layout {
    pub fn column_of(&self, id: BlockId) -> Option<usize> {
        self.col_of_block[id.0]
    }
}

/// The sparse nonlinear least-squares problem.
#[derive(Default)]
pub struct Problem {
    blocks: Vec<ParamBlock>,
    residual_blocks: Vec<ResidualBlock>,
    total_residual_dim: usize,
    single_threaded: bool,
}

impl Problem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluate residual blocks serially instead of with rayon.
    pub fn set_single_threaded(&mut self, single_threaded: bool) {
        self.single_threaded = single_threaded;
    }

    pub fn add_param_block(&mut self, values: DVector<f64>) -> BlockId {
        let id = BlockId(self.blocks.len());
        self.blocks.push(ParamBlock {
            values,
            fixed: false,
            point: false,
        });
        id
    }

    /// Mark a block constant; it keeps its initial values and gets no
    /// columns in the Jacobian.
    pub fn set_block_fixed(&mut self, id: BlockId) {
        self.blocks[id.0].fixed = true;
    }

    /// Mark a block as a triangulated point, ordering it into the
    /// Schur-eliminated part of the layout.
    pub fn mark_point_block(&mut self, id: BlockId) {
        self.blocks[id.0].point = true;
    }

    pub fn add_residual_block(
        &mut self,
        factor: Box<dyn Factor>,
        loss: Option<Box<dyn Loss>>,
        params: Vec<BlockId>,
    ) {
        let dim = factor.residual_dim();
        self.residual_blocks.push(ResidualBlock {
            factor,
            loss,
            params,
            row_start: self.total_residual_dim,
            dim,
        });
        self.total_residual_dim += dim;
    }

    pub fn num_residuals(&self) -> usize {
        self.total_residual_dim
    }

    pub fn num_residual_blocks(&self) -> usize {
        self.residual_blocks.len()
    }

    pub fn block_values(&self, id: BlockId) -> &DVector<f64> {
        &self.blocks[id.0].values
    }

    /// Compute the column layout. Fails when nothing is free to optimize.
    pub fn build_layout(&self) -> JitterResult<Layout> {
        let mut used = vec![false; self.blocks.len()];
        for rb in &self.residual_blocks {
            for id in &rb.params {
                used[id.0] = true;
            }
        }

        let mut col_of_block = vec![None; self.blocks.len()];
        let mut col = 0;
        for (i, block) in self.blocks.iter().enumerate() {
            if !block.point && used[i] && !block.fixed {
                col_of_block[i] = Some(col);
                col += block.values.len();
            }
        }
        let camera_dof = col;
        for (i, block) in self.blocks.iter().enumerate() {
            if block.point && used[i] && !block.fixed {
                col_of_block[i] = Some(col);
                col += block.values.len();
            }
        }

        if col == 0 {
            return Err(JitterError::Solver(
                "The problem has no free parameters.".to_string(),
            ));
        }
        Ok(Layout {
            col_of_block,
            num_cols: col,
            camera_dof,
            point_dof: col - camera_dof,
        })
    }

    /// Concatenate the free block values into a state vector.
    pub fn initial_state(&self, layout: &Layout) -> DVector<f64> {
        let mut x = DVector::zeros(layout.num_cols);
        for (i, block) in self.blocks.iter().enumerate() {
            if let Some(col) = layout.col_of_block[i] {
                x.rows_mut(col, block.values.len()).copy_from(&block.values);
            }
        }
        x
    }

    /// Write an optimized state vector back into the block storage.
    pub fn write_state(&mut self, layout: &Layout, x: &DVector<f64>) {
        for (i, block) in self.blocks.iter_mut().enumerate() {
            if let Some(col) = layout.col_of_block[i] {
                block.values.copy_from(&x.rows(col, block.values.len()));
            }
        }
    }

    fn gather_params(&self, rb: &ResidualBlock, layout: &Layout, x: &DVector<f64>) -> Vec<DVector<f64>> {
        rb.params
            .iter()
            .map(|id| {
                let block = &self.blocks[id.0];
                match layout.col_of_block[id.0] {
                    Some(col) => x.rows(col, block.values.len()).into_owned(),
                    None => block.values.clone(),
                }
            })
            .collect()
    }

    fn evaluate_block(
        &self,
        rb: &ResidualBlock,
        layout: &Layout,
        x: &DVector<f64>,
    ) -> (usize, DVector<f64>) {
        let params = self.gather_params(rb, layout, x);
        let mut residual = rb.factor.evaluate(&params);
        if let Some(loss) = rb.loss.as_ref() {
            let s = residual.norm_squared();
            let corrector = Corrector::new(s, &loss.evaluate(s));
            corrector.correct_residuals(&mut residual);
        }
        (rb.row_start, residual)
    }

    fn linearize_block(
        &self,
        rb: &ResidualBlock,
        layout: &Layout,
        x: &DVector<f64>,
    ) -> (usize, DVector<f64>, Vec<Triplet<usize, usize, f64>>) {
        let params = self.gather_params(rb, layout, x);
        let (mut residual, mut jacobian) = rb.factor.linearize(&params);
        if let Some(loss) = rb.loss.as_ref() {
            let s = residual.norm_squared();
            let corrector = Corrector::new(s, &loss.evaluate(s));
            corrector.correct_jacobian(&residual, &mut jacobian);
            corrector.correct_residuals(&mut residual);
        }

        // Scatter the block Jacobian into global triplets, skipping the
        // columns of fixed or unreferenced blocks.
        let mut triplets = Vec::new();
        let mut local_col = 0;
        for id in &rb.params {
            let width = self.blocks[id.0].values.len();
            if let Some(col) = layout.col_of_block[id.0] {
                for c in 0..width {
                    for r in 0..rb.dim {
                        let val = jacobian[(r, local_col + c)];
                        if val != 0.0 {
                            triplets.push(Triplet::new(rb.row_start + r, col + c, val));
                        }
                    }
                }
            }
            local_col += width;
        }
        (rb.row_start, residual, triplets)
    }

    /// Evaluate the loss-corrected residual vector at state `x`.
    pub fn evaluate(&self, layout: &Layout, x: &DVector<f64>) -> Mat<f64> {
        let parts: Vec<(usize, DVector<f64>)> = if self.single_threaded {
            self.residual_blocks
                .iter()
                .map(|rb| self.evaluate_block(rb, layout, x))
                .collect()
        } else {
            self.residual_blocks
                .par_iter()
                .map(|rb| self.evaluate_block(rb, layout, x))
                .collect()
        };

        let mut residuals = Mat::zeros(self.total_residual_dim, 1);
        for (row_start, r) in parts {
            for (i, v) in r.iter().enumerate() {
                residuals[(row_start + i, 0)] = *v;
            }
        }
        residuals
    }

    /// Evaluate the loss-corrected residual vector and sparse Jacobian at
    /// state `x`.
    pub fn linearize(
        &self,
        layout: &Layout,
        x: &DVector<f64>,
    ) -> JitterResult<(Mat<f64>, SparseColMat<usize, f64>)> {
        type BlockOut = (usize, DVector<f64>, Vec<Triplet<usize, usize, f64>>);
        let parts: Vec<BlockOut> = if self.single_threaded {
            self.residual_blocks
                .iter()
                .map(|rb| self.linearize_block(rb, layout, x))
                .collect()
        } else {
            self.residual_blocks
                .par_iter()
                .map(|rb| self.linearize_block(rb, layout, x))
                .collect()
        };

        let mut residuals = Mat::zeros(self.total_residual_dim, 1);
        let mut triplets = Vec::new();
        for (row_start, r, t) in parts {
            for (i, v) in r.iter().enumerate() {
                residuals[(row_start + i, 0)] = *v;
            }
            triplets.extend(t);
        }

        let jacobian = SparseColMat::try_new_from_triplets(
            self.total_residual_dim,
            layout.num_cols,
            &triplets,
        )
        .map_err(|e| JitterError::LinearAlgebra(format!("Failed to assemble the Jacobian: {e:?}")))?;

        Ok((residuals, jacobian))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    struct Prior {
        target: DVector<f64>,
    }

    impl Factor for Prior {
        fn residual_dim(&self) -> usize {
            self.target.len()
        }

        fn evaluate(&self, params: &[DVector<f64>]) -> DVector<f64> {
            &params[0] - &self.target
        }
    }

    #[test]
    fn fixed_blocks_get_no_columns() {
        let mut problem = Problem::new();
        let a = problem.add_param_block(DVector::from_vec(vec![1.0, 2.0]));
        let b = problem.add_param_block(DVector::from_vec(vec![3.0]));
        problem.set_block_fixed(b);
        problem.add_residual_block(
            Box::new(Prior {
                target: DVector::from_vec(vec![0.0, 0.0]),
            }),
            None,
            vec![a],
        );
        problem.add_residual_block(
            Box::new(Prior {
                target: DVector::from_vec(vec![0.0]),
            }),
            None,
            vec![b],
        );

        let layout = problem.build_layout().unwrap();
        assert_eq!(layout.num_cols, 2);
        assert!(layout.column_of(b).is_none());
    }

    #[test]
    fn point_blocks_are_ordered_last() {
        let mut problem = Problem::new();
        let p = problem.add_param_block(DVector::from_vec(vec![0.0, 0.0, 0.0]));
        problem.mark_point_block(p);
        let c = problem.add_param_block(DVector::from_vec(vec![0.0; 4]));
        problem.add_residual_block(
            Box::new(Prior {
                target: DVector::zeros(3),
            }),
            None,
            vec![p],
        );
        problem.add_residual_block(
            Box::new(Prior {
                target: DVector::zeros(4),
            }),
            None,
            vec![c],
        );

        let layout = problem.build_layout().unwrap();
        assert_eq!(layout.camera_dof, 4);
        assert_eq!(layout.point_dof, 3);
        assert_eq!(layout.column_of(c), Some(0));
        assert_eq!(layout.column_of(p), Some(4));
    }

    #[test]
    fn unreferenced_blocks_are_excluded() {
        let mut problem = Problem::new();
        let a = problem.add_param_block(DVector::from_vec(vec![1.0]));
        let _unused = problem.add_param_block(DVector::from_vec(vec![9.0]));
        problem.add_residual_block(
            Box::new(Prior {
                target: DVector::zeros(1),
            }),
            None,
            vec![a],
        );
        let layout = problem.build_layout().unwrap();
        assert_eq!(layout.num_cols, 1);
    }

    #[test]
    fn linearize_assembles_rows_in_addition_order() {
        let mut problem = Problem::new();
        let a = problem.add_param_block(DVector::from_vec(vec![5.0]));
        let b = problem.add_param_block(DVector::from_vec(vec![-2.0]));
        problem.add_residual_block(
            Box::new(Prior {
                target: DVector::from_vec(vec![1.0]),
            }),
            None,
            vec![a],
        );
        problem.add_residual_block(
            Box::new(Prior {
                target: DVector::from_vec(vec![1.0]),
            }),
            None,
            vec![b],
        );

        let layout = problem.build_layout().unwrap();
        let x = problem.initial_state(&layout);
        let (r, j) = problem.linearize(&layout, &x).unwrap();
        assert_relative_eq!(r[(0, 0)], 4.0, epsilon = 1e-12);
        assert_relative_eq!(r[(1, 0)], -3.0, epsilon = 1e-12);
        assert_eq!(j.nrows(), 2);
        assert_eq!(j.ncols(), 2);
    }

    #[test]
    fn write_state_round_trips() {
        let mut problem = Problem::new();
        let a = problem.add_param_block(DVector::from_vec(vec![1.0, 2.0]));
        problem.add_residual_block(
            Box::new(Prior {
                target: DVector::zeros(2),
            }),
            None,
            vec![a],
        );
        let layout = problem.build_layout().unwrap();
        let mut x = problem.initial_state(&layout);
        x[0] = 10.0;
        problem.write_state(&layout, &x);
        assert_relative_eq!(problem.block_values(a)[0], 10.0, epsilon = 1e-15);
    }
}
