use std::fmt;

use nalgebra::{DMatrix, SymmetricEigen};
use ndarray::{s, Array1, Array2, ArrayView2, Axis};

#[derive(Debug, PartialEq)]
pub enum DesignMatrixError {
    /// The matrix has no rows or no columns.
    Empty { rows: usize, columns: usize },
    NonFinite,
}

impl fmt::Display for DesignMatrixError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DesignMatrixError::Empty { rows, columns } => {
                write!(f, "Design matrix is empty ({} x {})", rows, columns)
            }
            DesignMatrixError::NonFinite => write!(f, "Design matrix contains non-finite values"),
        }
    }
}

impl std::error::Error for DesignMatrixError {}

/// Regressors for a linear model, one row per cadence.
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    pub values: Array2<f64>,
    pub columns: Vec<String>,
    pub name: String,
}

// Eigenvalues below this fraction of the largest carry no variance.
const RELATIVE_EIGEN_TOLERANCE: f64 = 1e-12;

impl DesignMatrix {
    pub fn new(values: Array2<f64>, name: impl Into<String>) -> Self {
        let columns = (0..values.ncols()).map(|i| i.to_string()).collect();
        DesignMatrix {
            values,
            columns,
            name: name.into(),
        }
    }

    pub fn nrows(&self) -> usize {
        self.values.nrows()
    }

    pub fn ncols(&self) -> usize {
        self.values.ncols()
    }

    /// Keeps only the columns where every value is finite.
    pub fn drop_nonfinite_columns(&self) -> DesignMatrix {
        let keep: Vec<usize> = self
            .values
            .axis_iter(Axis(1))
            .enumerate()
            .filter(|(_, column)| column.iter().all(|v| v.is_finite()))
            .map(|(i, _)| i)
            .collect();
        DesignMatrix {
            values: self.values.select(Axis(1), &keep),
            columns: keep.iter().map(|i| self.columns[*i].clone()).collect(),
            name: self.name.clone(),
        }
    }

    /// Reduces the columns to at most `n` principal components.
    ///
    /// Columns are centered first. The components are the unit-norm left
    /// singular vectors of the centered matrix, ordered by decreasing
    /// variance. Components without variance are dropped, so the result may
    /// have fewer than `n` columns.
    pub fn pca(&self, n: usize) -> Result<DesignMatrix, DesignMatrixError> {
        let (rows, columns) = self.values.dim();
        if rows == 0 || columns == 0 {
            return Err(DesignMatrixError::Empty { rows, columns });
        }
        if self.values.iter().any(|v| !v.is_finite()) {
            return Err(DesignMatrixError::NonFinite);
        }

        let mean = self
            .values
            .mean_axis(Axis(0))
            .ok_or(DesignMatrixError::Empty { rows, columns })?;
        let centered = &self.values - &mean.insert_axis(Axis(0));

        let components = left_singular_vectors(centered.view(), n.min(columns));
        let columns = (0..components.ncols())
            .map(|i| format!("pca{}", i + 1))
            .collect();

        Ok(DesignMatrix {
            values: components,
            columns,
            name: self.name.clone(),
        })
    }

    pub fn append_constant(&self) -> DesignMatrix {
        let mut values = Array2::ones((self.nrows(), self.ncols() + 1));
        values.slice_mut(s![.., ..self.ncols()]).assign(&self.values);
        let mut columns = self.columns.clone();
        columns.push("offset".to_string());
        DesignMatrix {
            values,
            columns,
            name: self.name.clone(),
        }
    }
}

/// Up to `n` left singular vectors of `x`, from the eigendecomposition of the
/// smaller of its two Gram matrices.
fn left_singular_vectors(x: ArrayView2<f64>, n: usize) -> Array2<f64> {
    let (rows, columns) = x.dim();
    let use_outer = rows <= columns;

    let gram = if use_outer {
        x.dot(&x.t())
    } else {
        x.t().dot(&x)
    };
    let size = gram.nrows();
    let eigen = SymmetricEigen::new(DMatrix::from_fn(size, size, |i, j| gram[[i, j]]));

    let mut order: Vec<usize> = (0..size).collect();
    order.sort_by(|a, b| eigen.eigenvalues[*b].total_cmp(&eigen.eigenvalues[*a]));
    let largest = order
        .first()
        .map(|i| eigen.eigenvalues[*i])
        .unwrap_or(0.0);
    let threshold = largest * RELATIVE_EIGEN_TOLERANCE;

    let selected: Vec<usize> = order
        .into_iter()
        .take(n)
        .filter(|i| largest > 0.0 && eigen.eigenvalues[*i] > threshold)
        .collect();

    let mut out = Array2::zeros((rows, selected.len()));
    for (k, i) in selected.iter().enumerate() {
        let vector: Array1<f64> = eigen.eigenvectors.column(*i).iter().copied().collect();
        let mut component = if use_outer {
            vector
        } else {
            x.dot(&vector) / eigen.eigenvalues[*i].sqrt()
        };
        // Fix the sign so the largest-magnitude entry is positive.
        let pivot = component
            .iter()
            .copied()
            .max_by(|a, b| a.abs().total_cmp(&b.abs()))
            .unwrap_or(0.0);
        if pivot < 0.0 {
            component.mapv_inplace(|v| -v);
        }
        out.column_mut(k).assign(&component);
    }
    out
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use ndarray::{array, Array1, Array2};

    use super::*;

    fn correlation(a: &Array1<f64>, b: &Array1<f64>) -> f64 {
        let a = a - a.mean().unwrap();
        let b = b - b.mean().unwrap();
        a.dot(&b) / (a.dot(&a).sqrt() * b.dot(&b).sqrt())
    }

    #[test]
    fn test_pca_recovers_shared_signal() {
        let signal: Array1<f64> = (0..40).map(|i| (i as f64 * 0.3).sin()).collect();
        let values = Array2::from_shape_fn((40, 6), |(t, p)| {
            100.0 + p as f64 + (1.0 + p as f64 * 0.5) * signal[t]
        });

        let pca = DesignMatrix::new(values, "regressors").pca(5).unwrap();

        // A rank one input keeps a single component.
        assert_eq!(pca.ncols(), 1);
        let component = pca.values.column(0).to_owned();
        assert_abs_diff_eq!(correlation(&component, &signal).abs(), 1.0, epsilon = 1e-9);
        assert_abs_diff_eq!(component.dot(&component), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn test_pca_tall_and_wide_shapes() {
        let tall = Array2::from_shape_fn((12, 4), |(t, p)| ((t * (p + 1)) as f64).cos() + (t as f64) * 0.1);
        let wide = Array2::from_shape_fn((4, 12), |(t, p)| ((t * (p + 1)) as f64).cos() + (p as f64) * 0.1);

        let tall_pca = DesignMatrix::new(tall, "tall").pca(2).unwrap();
        let wide_pca = DesignMatrix::new(wide, "wide").pca(10).unwrap();

        assert_eq!(tall_pca.values.dim(), (12, 2));
        // Centering four rows leaves at most three components.
        assert!(wide_pca.ncols() <= 3);
        for k in 0..tall_pca.ncols() {
            let column = tall_pca.values.column(k);
            assert_abs_diff_eq!(column.dot(&column), 1.0, epsilon = 1e-9);
            assert_abs_diff_eq!(column.sum(), 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_pca_rank_clamped_to_columns() {
        let values = Array2::from_shape_fn((30, 2), |(t, p)| ((t + 3 * p) as f64).sqrt());
        let pca = DesignMatrix::new(values, "regressors").pca(5).unwrap();
        assert!(pca.ncols() <= 2);
    }

    #[test]
    fn test_constant_input_has_no_components() {
        let values = Array2::from_elem((10, 3), 7.0);
        let dm = DesignMatrix::new(values, "flat").pca(3).unwrap().append_constant();
        assert_eq!(dm.values.dim(), (10, 1));
        assert_eq!(dm.columns, vec!["offset".to_string()]);
    }

    #[test]
    fn test_append_constant() {
        let dm = DesignMatrix::new(array![[1.0], [2.0]], "dm").append_constant();
        assert_eq!(dm.values, array![[1.0, 1.0], [2.0, 1.0]]);
        assert_eq!(dm.columns, vec!["0".to_string(), "offset".to_string()]);
    }

    #[test]
    fn test_drop_nonfinite_columns() {
        let dm = DesignMatrix::new(array![[1.0, f64::NAN, 3.0], [4.0, 5.0, 6.0]], "dm");
        let dm = dm.drop_nonfinite_columns();
        assert_eq!(dm.values, array![[1.0, 3.0], [4.0, 6.0]]);
        assert_eq!(dm.columns, vec!["0".to_string(), "2".to_string()]);
        assert!(matches!(
            DesignMatrix::new(Array2::zeros((0, 3)), "empty").pca(1),
            Err(DesignMatrixError::Empty { .. })
        ));
    }
}
