use anyhow::bail;
use starlark::environment::GlobalsBuilder;
use starlark::starlark_module;
use starlark::values::float::StarlarkFloat;
use starlark::values::list::UnpackList;

/// Numeric builtins preloaded into torch-profile environments.
///
/// This is the warm runtime of the heavy profile: problems flagged
/// `requires_torch` may reference these names from `runner_expr` or from
/// submission code.
#[starlark_module]
pub(crate) fn tensor_globals(builder: &mut GlobalsBuilder) {
    fn zeros(n: i32) -> anyhow::Result<Vec<f64>> {
        Ok(vec![0.0; checked_len(n)?])
    }

    fn ones(n: i32) -> anyhow::Result<Vec<f64>> {
        Ok(vec![1.0; checked_len(n)?])
    }

    fn full(n: i32, value: StarlarkFloat) -> anyhow::Result<Vec<f64>> {
        Ok(vec![value.0; checked_len(n)?])
    }

    fn arange(n: i32) -> anyhow::Result<Vec<f64>> {
        Ok((0..checked_len(n)?).map(|i| i as f64).collect())
    }

    fn eye(n: i32) -> anyhow::Result<Vec<Vec<f64>>> {
        let n = checked_len(n)?;
        Ok((0..n)
            .map(|row| (0..n).map(|col| if row == col { 1.0 } else { 0.0 }).collect())
            .collect())
    }

    fn dot(a: UnpackList<StarlarkFloat>, b: UnpackList<StarlarkFloat>) -> anyhow::Result<f64> {
        let a: Vec<f64> = a.items.into_iter().map(|v| v.0).collect();
        let b: Vec<f64> = b.items.into_iter().map(|v| v.0).collect();
        if a.len() != b.len() {
            bail!("dot: length mismatch ({} vs {})", a.len(), b.len());
        }
        Ok(a.iter().zip(&b).map(|(x, y)| x * y).sum())
    }

    fn matmul(
        a: UnpackList<UnpackList<StarlarkFloat>>,
        b: UnpackList<UnpackList<StarlarkFloat>>,
    ) -> anyhow::Result<Vec<Vec<f64>>> {
        let a: Vec<Vec<f64>> = a
            .items
            .into_iter()
            .map(|row| row.items.into_iter().map(|v| v.0).collect())
            .collect();
        let b: Vec<Vec<f64>> = b
            .items
            .into_iter()
            .map(|row| row.items.into_iter().map(|v| v.0).collect())
            .collect();
        let inner = a.first().map_or(0, Vec::len);
        if a.iter().any(|row| row.len() != inner) {
            bail!("matmul: left operand is ragged");
        }
        if b.len() != inner {
            bail!("matmul: shape mismatch ({}x{inner} @ {}x?)", a.len(), b.len());
        }
        let cols = b.first().map_or(0, Vec::len);
        if b.iter().any(|row| row.len() != cols) {
            bail!("matmul: right operand is ragged");
        }
        Ok(a.iter()
            .map(|row| {
                (0..cols)
                    .map(|col| row.iter().zip(&b).map(|(x, brow)| x * brow[col]).sum())
                    .collect()
            })
            .collect())
    }

    fn transpose(a: UnpackList<UnpackList<StarlarkFloat>>) -> anyhow::Result<Vec<Vec<f64>>> {
        let a: Vec<Vec<f64>> = a
            .items
            .into_iter()
            .map(|row| row.items.into_iter().map(|v| v.0).collect())
            .collect();
        let cols = a.first().map_or(0, Vec::len);
        if a.iter().any(|row| row.len() != cols) {
            bail!("transpose: ragged input");
        }
        Ok((0..cols)
            .map(|col| a.iter().map(|row| row[col]).collect())
            .collect())
    }

    fn vsum(a: UnpackList<StarlarkFloat>) -> anyhow::Result<f64> {
        let a: Vec<f64> = a.items.into_iter().map(|v| v.0).collect();
        Ok(a.iter().sum())
    }

    fn vmean(a: UnpackList<StarlarkFloat>) -> anyhow::Result<f64> {
        let a: Vec<f64> = a.items.into_iter().map(|v| v.0).collect();
        if a.is_empty() {
            bail!("vmean: empty input");
        }
        Ok(a.iter().sum::<f64>() / a.len() as f64)
    }
}

fn checked_len(n: i32) -> anyhow::Result<usize> {
    if n < 0 {
        bail!("size must be non-negative, got {n}");
    }
    Ok(n as usize)
}
