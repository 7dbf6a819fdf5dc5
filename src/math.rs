use faer::{Col, Mat};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::StandardNormal;

pub(crate) fn col_means(points: &[Vec<f64>]) -> Vec<f64> {
    let dim = points.first().map_or(0, |p| p.len());
    let mut mean = vec![0f64; dim];
    for point in points {
        for (m, x) in mean.iter_mut().zip(point.iter()) {
            *m += x;
        }
    }
    let n = points.len().max(1) as f64;
    mean.iter_mut().for_each(|m| *m /= n);
    mean
}

/// Empirical covariance of a set of points (rows are observations).
pub(crate) fn covariance(points: &[Vec<f64>]) -> Mat<f64> {
    let dim = points.first().map_or(0, |p| p.len());
    let mean = col_means(points);
    let denom = points.len().saturating_sub(1).max(1) as f64;
    Mat::from_fn(dim, dim, |a, b| {
        points
            .iter()
            .map(|p| (p[a] - mean[a]) * (p[b] - mean[b]))
            .sum::<f64>()
            / denom
    })
}

fn sym_eigen(m: &Mat<f64>) -> Option<(Col<f64>, Mat<f64>)> {
    let eig = m.self_adjoint_eigen(faer::Side::Lower).ok()?;
    Some((eig.S().column_vector().to_owned(), eig.U().to_owned()))
}

/// Symmetric positive-semidefinite square root, clamping negative
/// eigenvalues to zero.
pub(crate) fn sym_sqrt(m: &Mat<f64>) -> Option<Mat<f64>> {
    let (mut vals, vecs) = sym_eigen(m)?;
    vals.iter_mut().for_each(|v| *v = v.max(0f64).sqrt());
    Some((&vecs) * vals.into_diagonal() * vecs.transpose())
}

/// Pseudo-inverse of a symmetric matrix: eigenvalues below the relative
/// tolerance contribute nothing.
pub(crate) fn sym_pseudo_inverse(m: &Mat<f64>) -> Option<Mat<f64>> {
    let (mut vals, vecs) = sym_eigen(m)?;
    let cutoff = vals.iter().fold(0f64, |acc, v| acc.max(v.abs())) * 1e-12;
    vals.iter_mut()
        .for_each(|v| *v = if v.abs() > cutoff { v.recip() } else { 0f64 });
    Some((&vecs) * vals.into_diagonal() * vecs.transpose())
}

/// Inverse of a symmetric matrix expected to be positive definite, with
/// eigenvalues floored so the result is always positive definite.
pub(crate) fn sym_inverse_psd(m: &Mat<f64>) -> Option<Mat<f64>> {
    let (mut vals, vecs) = sym_eigen(m)?;
    let floor = (vals.iter().fold(0f64, |acc, v| acc.max(*v)) * 1e-10).max(1e-300);
    vals.iter_mut().for_each(|v| *v = v.max(floor).recip());
    Some((&vecs) * vals.into_diagonal() * vecs.transpose())
}

pub(crate) fn matvec(m: &Mat<f64>, v: &[f64]) -> Vec<f64> {
    let mut out = vec![0f64; m.nrows()];
    for (j, vj) in v.iter().enumerate() {
        for (o, mij) in out.iter_mut().zip(m.col(j).iter()) {
            *o += mij * vj;
        }
    }
    out
}

pub(crate) fn diag_mat(diag: &[f64]) -> Mat<f64> {
    Mat::from_fn(
        diag.len(),
        diag.len(),
        |i, j| if i == j { diag[i] } else { 0f64 },
    )
}

pub(crate) fn standard_normal_draws(dim: usize, n: usize, rng: &mut ChaCha8Rng) -> Vec<Vec<f64>> {
    (0..n)
        .map(|_| (0..dim).map(|_| rng.sample(StandardNormal)).collect())
        .collect()
}

/// Draws from a multivariate normal with the given mean and covariance,
/// through the symmetric square root of the covariance.
pub(crate) fn multivariate_normal_draws(
    mean: &[f64],
    cov: &Mat<f64>,
    n: usize,
    rng: &mut ChaCha8Rng,
) -> Option<Vec<Vec<f64>>> {
    let sqrt = sym_sqrt(cov)?;
    let dim = mean.len();
    Some(
        (0..n)
            .map(|_| {
                let z: Vec<f64> = (0..dim).map(|_| rng.sample(StandardNormal)).collect();
                let step = matvec(&sqrt, &z);
                mean.iter().zip(step.iter()).map(|(m, s)| m + s).collect()
            })
            .collect(),
    )
}

/// Evenly strided subsample of `0..len`, at most `n` indices.
pub(crate) fn strided_indices(len: usize, n: usize) -> Vec<usize> {
    if n == 0 || len == 0 {
        return Vec::new();
    }
    let stride = (len / n).max(1);
    (0..len).step_by(stride).take(n).collect()
}
