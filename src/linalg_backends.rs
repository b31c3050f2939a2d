// src/linalg_backends.rs

#[derive(Debug, Default, Copy, Clone)]
pub struct LinAlgBackendProvider<F: 'static + Copy + Send + Sync> {
    _phantom: PhantomData<F>,
}

impl<F: 'static + Copy + Send + Sync> LinAlgBackendProvider<F> {
    pub fn new() -> Self {
        Self { _phantom: PhantomData }
    }
}

#[cfg(not(any(
    feature = "backend_faer",
    feature = "backend_openblas",
    feature = "backend_openblas_system",
    feature = "backend_mkl",
    feature = "backend_mkl_system"
)))]
compile_error!("tsqr_direct needs a linear algebra backend: enable `backend_faer` or one of the `backend_openblas*`/`backend_mkl*` features");

use ndarray::{Array1, Array2};
use std::error::Error;
use std::marker::PhantomData;

// --- Trait Definitions ---

/// Output of a thin QR factorization of an `m x n` matrix, with `k = min(m, n)`.
#[derive(Debug)]
pub struct QROutput<F: 'static> {
    /// Orthonormal columns, shape `(m, k)`.
    pub q: Array2<F>,
    /// Upper-triangular factor, shape `(k, n)`.
    pub r: Array2<F>,
}

/// Trait for QR decomposition.
///
/// `qr_r_factor` must return the same `R` that `qr_thin` would for the same input:
/// the Direct-Q protocol factors every partition twice and relies on both passes agreeing.
pub trait BackendQR<F: 'static + Copy + Send + Sync> {
    fn qr_thin(&self, matrix: &Array2<F>) -> Result<QROutput<F>, Box<dyn Error + Send + Sync>>;
    fn qr_r_factor(&self, matrix: &Array2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>>;
}

/// Output of a Singular Value Decomposition.
#[derive(Debug)]
pub struct SVDOutput<F: 'static> {
    pub u: Option<Array2<F>>,
    pub s: Array1<F>,
    pub vt: Option<Array2<F>>,
}

/// Trait for Singular Value Decomposition.
pub trait BackendSVD<F: 'static + Copy + Send + Sync> {
    fn svd_into(&self, matrix: Array2<F>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<F>, Box<dyn Error + Send + Sync>>;
}

fn empty_qr(nrows: usize, ncols: usize) -> QROutput<f64> {
    let k = nrows.min(ncols);
    QROutput { q: Array2::zeros((nrows, k)), r: Array2::zeros((k, ncols)) }
}

// --- NdarrayLinAlgBackend Implementation ---
#[cfg(any(
    feature = "backend_openblas",
    feature = "backend_openblas_system",
    feature = "backend_mkl",
    feature = "backend_mkl_system"
))]
mod ndarray_specific_code {
    use super::{empty_qr, BackendQR, BackendSVD, QROutput, SVDOutput};
    use ndarray::Array2;
    use ndarray_linalg::{SVDInto as NdLinalgSVDInto, QR as NdLinalgQR};
    use std::error::Error;

    #[derive(Debug, Default, Copy, Clone)]
    pub struct NdarrayLinAlgBackend;

    // Helper to convert ndarray-linalg's error to Box<dyn Error + Send + Sync>
    fn to_dyn_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
        Box::new(e)
    }

    impl BackendQR<f64> for NdarrayLinAlgBackend {
        fn qr_thin(&self, matrix: &Array2<f64>) -> Result<QROutput<f64>, Box<dyn Error + Send + Sync>> {
            let (nrows, ncols) = matrix.dim();
            if nrows == 0 || ncols == 0 {
                return Ok(empty_qr(nrows, ncols));
            }
            let (q, r) = matrix.qr().map_err(to_dyn_error)?;
            Ok(QROutput { q, r })
        }

        fn qr_r_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, Box<dyn Error + Send + Sync>> {
            Ok(self.qr_thin(matrix)?.r)
        }
    }

    impl BackendSVD<f64> for NdarrayLinAlgBackend {
        fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<f64>, Box<dyn Error + Send + Sync>> {
            let (u, s, vt) = matrix.svd_into(compute_u, compute_v).map_err(to_dyn_error)?;
            Ok(SVDOutput { u, s, vt })
        }
    }
}

// --- FaerLinAlgBackend Implementation ---
#[cfg(feature = "backend_faer")]
mod faer_specific_code { // Encapsulate faer-specific code and its imports
    use super::{empty_qr, BackendQR, BackendSVD, QROutput, SVDOutput};
    use faer::linalg::solvers::{Qr as FaerSolverQr, Svd as FaerSolverSvd};
    use faer::{Mat, MatRef};
    use ndarray::{Array1, Array2};
    use std::error::Error;

    fn to_dyn_error_faer(msg: String) -> Box<dyn Error + Send + Sync> {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg))
    }

    #[derive(Debug, Default, Copy, Clone)]
    pub struct FaerLinAlgBackend;

    // Copies element-wise, so any ndarray layout (including transposed views) is accepted.
    fn ndarray_to_faer_mat(matrix: &Array2<f64>) -> Mat<f64> {
        Mat::from_fn(matrix.nrows(), matrix.ncols(), |i, j| matrix[[i, j]])
    }

    fn faer_mat_to_ndarray(faer_mat: MatRef<'_, f64>) -> Array2<f64> {
        Array2::from_shape_fn((faer_mat.nrows(), faer_mat.ncols()), |(i, j)| faer_mat[(i, j)])
    }

    impl BackendQR<f64> for FaerLinAlgBackend {
        fn qr_thin(&self, matrix: &Array2<f64>) -> Result<QROutput<f64>, Box<dyn Error + Send + Sync>> {
            let (nrows, ncols) = matrix.dim();
            if nrows == 0 || ncols == 0 {
                return Ok(empty_qr(nrows, ncols));
            }
            let faer_mat = ndarray_to_faer_mat(matrix);
            let qr_decomp = FaerSolverQr::new(faer_mat.as_ref());
            let q_thin = qr_decomp.compute_thin_Q();
            let r_thin = qr_decomp.thin_R();
            Ok(QROutput {
                q: faer_mat_to_ndarray(q_thin.as_ref()),
                r: faer_mat_to_ndarray(r_thin),
            })
        }

        fn qr_r_factor(&self, matrix: &Array2<f64>) -> Result<Array2<f64>, Box<dyn Error + Send + Sync>> {
            let (nrows, ncols) = matrix.dim();
            if nrows == 0 || ncols == 0 {
                return Ok(empty_qr(nrows, ncols).r);
            }
            let faer_mat = ndarray_to_faer_mat(matrix);
            let qr_decomp = FaerSolverQr::new(faer_mat.as_ref());
            Ok(faer_mat_to_ndarray(qr_decomp.thin_R()))
        }
    }

    impl BackendSVD<f64> for FaerLinAlgBackend {
        fn svd_into(&self, matrix: Array2<f64>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<f64>, Box<dyn Error + Send + Sync>> {
            let (nrows, ncols) = matrix.dim();
            if matrix.is_empty() {
                let k_dim = nrows.min(ncols);
                return Ok(SVDOutput {
                    u: if compute_u { Some(Array2::zeros((nrows, k_dim))) } else { None },
                    s: Array1::zeros(k_dim),
                    vt: if compute_v { Some(Array2::zeros((k_dim, ncols))) } else { None },
                });
            }
            let faer_mat = ndarray_to_faer_mat(&matrix);

            let svd_solver_instance = FaerSolverSvd::new_thin(faer_mat.as_ref())
                .map_err(|e| to_dyn_error_faer(format!("Faer SVD computation failed: {:?}", e)))?;

            let s_values: Vec<f64> = svd_solver_instance.S().column_vector().iter().cloned().collect();

            let u_ndarray = if compute_u {
                Some(faer_mat_to_ndarray(svd_solver_instance.U()))
            } else { None };

            let vt_ndarray = if compute_v {
                Some(faer_mat_to_ndarray(svd_solver_instance.V()).t().to_owned())
            } else { None };

            Ok(SVDOutput { u: u_ndarray, s: Array1::from_vec(s_values), vt: vt_ndarray })
        }
    }
} // End of faer_specific_code module

// --- LinAlgBackendProvider Dispatch ---

#[cfg(feature = "backend_faer")]
type SelectedBackend = faer_specific_code::FaerLinAlgBackend;

#[cfg(not(feature = "backend_faer"))]
type SelectedBackend = ndarray_specific_code::NdarrayLinAlgBackend;

impl<F> BackendQR<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    SelectedBackend: BackendQR<F>,
{
    fn qr_thin(&self, matrix: &Array2<F>) -> Result<QROutput<F>, Box<dyn Error + Send + Sync>> {
        SelectedBackend::default().qr_thin(matrix)
    }

    fn qr_r_factor(&self, matrix: &Array2<F>) -> Result<Array2<F>, Box<dyn Error + Send + Sync>> {
        SelectedBackend::default().qr_r_factor(matrix)
    }
}

impl<F> BackendSVD<F> for LinAlgBackendProvider<F>
where
    F: 'static + Copy + Send + Sync,
    SelectedBackend: BackendSVD<F>,
{
    fn svd_into(&self, matrix: Array2<F>, compute_u: bool, compute_v: bool) -> Result<SVDOutput<F>, Box<dyn Error + Send + Sync>> {
        SelectedBackend::default().svd_into(matrix, compute_u, compute_v)
    }
}
