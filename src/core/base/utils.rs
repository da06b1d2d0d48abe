use faer::{Mat, MatRef};

////////////////////
// Util functions //
////////////////////

/// Calculates the column sums of a matrix
///
/// ### Params
///
/// * `mat` - The matrix for which to calculate the column-wise sums
///
/// ### Returns
///
/// Vector of the column sums.
pub fn col_sums(mat: MatRef<f64>) -> Vec<f64> {
    let n_rows = mat.nrows();
    let ones = Mat::from_fn(n_rows, 1, |_, _| 1.0);
    let col_sums = ones.transpose() * mat;

    col_sums.row(0).iter().cloned().collect()
}

/// Calculates the row sums of a matrix
///
/// ### Params
///
/// * `mat` - The matrix for which to calculate the row-wise sums
///
/// ### Returns
///
/// Vector of the row sums.
pub fn row_sums(mat: MatRef<f64>) -> Vec<f64> {
    let n_cols = mat.ncols();
    let ones = Mat::from_fn(n_cols, 1, |_, _| 1.0);
    let row_sums = mat * ones;

    row_sums.col(0).iter().cloned().collect()
}

/// Centre (and optionally scale) the columns of a matrix
///
/// ### Params
///
/// * `mat` - The matrix on which to apply column-wise centring
/// * `scale_sd` - Shall the columns additionally be scaled to unit standard
///   deviation
///
/// ### Returns
///
/// The centred (and scaled) matrix.
pub fn scale_matrix_col(mat: &MatRef<f64>, scale_sd: bool) -> Mat<f64> {
    let n_rows = mat.nrows();
    let n_cols = mat.ncols();

    let mut means = vec![0.0; n_cols];
    for j in 0..n_cols {
        for i in 0..n_rows {
            means[j] += mat[(i, j)];
        }
        means[j] /= n_rows as f64;
    }

    let mut result = mat.to_owned();
    for j in 0..n_cols {
        let mean = means[j];
        for i in 0..n_rows {
            result[(i, j)] -= mean;
        }
    }

    if !scale_sd {
        return result;
    }

    let mut std_devs = vec![0.0; n_cols];
    for j in 0..n_cols {
        for i in 0..n_rows {
            let val = result[(i, j)];
            std_devs[j] += val * val;
        }
        std_devs[j] = (std_devs[j] / (n_rows as f64 - 1.0)).sqrt();
        if std_devs[j] < 1e-10 {
            std_devs[j] = 1.0;
        }
    }

    for j in 0..n_cols {
        let std_dev = std_devs[j];
        for i in 0..n_rows {
            result[(i, j)] /= std_dev;
        }
    }

    result
}

/// L2 normalise the columns of a matrix
///
/// Columns with an L2 norm below 1e-10 are left untouched.
///
/// ### Params
///
/// * `mat` - The matrix on which to apply column-wise L2 normalisation
///
/// ### Returns
///
/// The matrix with L2-normalised columns.
pub fn normalise_matrix_col_l2(mat: &MatRef<f64>) -> Mat<f64> {
    let mut normalized = mat.to_owned();

    for j in 0..mat.ncols() {
        let col = mat.col(j);
        let norm = col.norm_l2();

        if norm > 1e-10 {
            for i in 0..mat.nrows() {
                normalized[(i, j)] = mat[(i, j)] / norm;
            }
        }
    }

    normalized
}

/// Normalise the columns of a matrix to sum to one
///
/// Columns summing to less than 1e-12 are left untouched.
///
/// ### Params
///
/// * `mat` - The matrix on which to apply column-wise sum normalisation
///
/// ### Returns
///
/// The matrix with each column a distribution over rows.
pub fn normalise_matrix_col_sum(mat: &MatRef<f64>) -> Mat<f64> {
    let sums = col_sums(mat.as_ref());
    let mut normalized = mat.to_owned();

    for j in 0..mat.ncols() {
        if sums[j] > 1e-12 {
            for i in 0..mat.nrows() {
                normalized[(i, j)] = mat[(i, j)] / sums[j];
            }
        }
    }

    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use faer::mat;

    #[test]
    fn test_row_col_sums() {
        let m = mat![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]];
        assert_eq!(col_sums(m.as_ref()), vec![9.0, 12.0]);
        assert_eq!(row_sums(m.as_ref()), vec![3.0, 7.0, 11.0]);
    }

    #[test]
    fn test_scale_matrix_col() {
        let m = mat![[1.0, 10.0], [3.0, 20.0]];
        let centred = scale_matrix_col(&m.as_ref(), false);
        assert!((centred[(0, 0)] + 1.0).abs() < 1e-12);
        assert!((centred[(1, 0)] - 1.0).abs() < 1e-12);
        assert!((centred[(0, 1)] + 5.0).abs() < 1e-12);
    }

    #[test]
    fn test_normalise_matrix_col_sum() {
        let m = mat![[1.0, 4.0], [3.0, 12.0]];
        let norm = normalise_matrix_col_sum(&m.as_ref());
        assert!((norm[(0, 0)] - 0.25).abs() < 1e-12);
        assert!((norm[(1, 1)] - 0.75).abs() < 1e-12);
    }
}
