use crate::common_io::{read_lines_of_types, write_lines, Delimiter};
use crate::traits::*;
pub use nalgebra::DMatrix;

use std::fmt::Display;
use std::str::FromStr;

/// Collect parsed rows into a row-major vector, checking every row
/// has the same number of columns
pub(crate) fn flatten_rows<T>(rows: Vec<Vec<T>>) -> anyhow::Result<(usize, usize, Vec<T>)> {
    let nrows = rows.len();
    let ncols = rows
        .first()
        .map(|x| x.len())
        .ok_or(anyhow::anyhow!("no data in file"))?;

    if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != ncols) {
        return Err(anyhow::anyhow!(
            "row {} has {} columns, expected {}",
            i + 1,
            row.len(),
            ncols
        ));
    }

    Ok((nrows, ncols, rows.into_iter().flatten().collect()))
}

impl<T> IoOps for DMatrix<T>
where
    T: nalgebra::Scalar + Send + FromStr + Display + Copy,
    <T as FromStr>::Err: Display,
{
    type Scalar = T;
    type Mat = Self;

    fn read_file_delim(
        tsv_file: &str,
        delim: impl Into<Delimiter>,
        skip: Option<usize>,
    ) -> anyhow::Result<Self::Mat> {
        let hdr_line = match skip {
            Some(skip) => skip as i64,
            None => -1, // no skipping
        };

        let data = read_lines_of_types::<T>(tsv_file, delim, hdr_line)?.lines;
        let (nrows, ncols, data) = flatten_rows(data)?;
        Ok(DMatrix::<T>::from_row_iterator(nrows, ncols, data))
    }

    fn write_file_delim(&self, tsv_file: &str, delim: &str) -> anyhow::Result<()> {
        // par_iter() or par_bridge() will
        // mess up the order of the rows
        let lines = self
            .row_iter()
            .map(|row| {
                row.iter()
                    .map(|x| format!("{}", *x))
                    .collect::<Vec<String>>()
                    .join(delim)
                    .into_boxed_str()
            })
            .collect::<Vec<_>>();

        write_lines(&lines, tsv_file)
    }
}
