use serde::{Deserialize, Serialize};

use crate::session::SqlValue;
use crate::{DeleteError, Result};

/// Placeholder replaced by the `?` list of one chunk.
pub const PARAMETER_LIST: &str = "{parameters}";

/// Bound on how many executions an even split may cost relative to the
/// fewest possible.
pub const EVEN_SPLIT_EXECUTION_FACTOR: usize = 2;

/// How `total` values are split across statements of at most `max` parameters.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct ChunkPlan {
    pub chunk_size: usize,
    pub full_chunks: usize,
    pub remainder: usize,
}

impl ChunkPlan {
    /// Split `total` values into chunks of at most `max`, preferring equal
    /// chunks so a single prepared statement serves every execution.
    ///
    /// An even split is taken when one needs at most
    /// [`EVEN_SPLIT_EXECUTION_FACTOR`] times the minimal number of executions
    /// (1001 values under 256 become 7 x 143). Otherwise chunks are `max`
    /// wide with one trailing remainder (1009 under 256 become 256, 256, 256, 241).
    ///
    /// # Errors
    /// Returns [`DeleteError::InvalidConfig`] when `max` is zero.
    pub fn new(total: usize, max: usize) -> Result<Self> {
        if max == 0 {
            return Err(DeleteError::InvalidConfig(
                "max_batch_parameters must be at least 1".to_string(),
            ));
        }

        if total == 0 {
            return Ok(Self { chunk_size: 0, full_chunks: 0, remainder: 0 });
        }

        if total <= max {
            return Ok(Self { chunk_size: total, full_chunks: 1, remainder: 0 });
        }

        let minimal = total.div_ceil(max);
        let widest = minimal.saturating_mul(EVEN_SPLIT_EXECUTION_FACTOR).min(total);
        if let Some(statements) = (minimal..=widest).find(|count| total % count == 0) {
            return Ok(Self { chunk_size: total / statements, full_chunks: statements, remainder: 0 });
        }

        Ok(Self { chunk_size: max, full_chunks: total / max, remainder: total % max })
    }

    #[must_use]
    pub fn sizes(&self) -> Vec<usize> {
        let mut sizes = vec![self.chunk_size; self.full_chunks];
        if self.remainder > 0 {
            sizes.push(self.remainder);
        }
        sizes
    }

    /// Number of distinct prepared statements needed.
    #[must_use]
    pub fn prepared_statements(&self) -> usize {
        usize::from(self.full_chunks > 0) + usize::from(self.remainder > 0)
    }
}

/// One prepared statement and the parameter sets it runs with, in order.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
pub struct BatchedStatement {
    pub sql: String,
    pub executions: Vec<Vec<SqlValue>>,
}

impl BatchedStatement {
    #[must_use]
    pub fn single(sql: impl Into<String>, params: Vec<SqlValue>) -> Self {
        Self { sql: sql.into(), executions: vec![params] }
    }

    #[must_use]
    pub fn parameter_count(&self) -> usize {
        self.executions.iter().map(Vec::len).sum()
    }
}

/// Expand `template` into IN-list statements covering every value.
///
/// The remainder statement, when present, is always last.
///
/// # Errors
/// Returns [`DeleteError::InvalidStatement`] unless the template holds exactly one
/// [`PARAMETER_LIST`], and [`DeleteError::InvalidConfig`] when `max_parameters` is zero.
pub fn build_in_clause_batches<I>(
    template: &str,
    values: I,
    max_parameters: usize,
) -> Result<Vec<BatchedStatement>>
where
    I: IntoIterator,
    I::Item: Into<SqlValue>,
{
    if template.matches(PARAMETER_LIST).count() != 1 {
        return Err(DeleteError::InvalidStatement(format!(
            "template must contain exactly one {PARAMETER_LIST} placeholder: {template}"
        )));
    }

    let values = values.into_iter().map(Into::into).collect::<Vec<SqlValue>>();
    let plan = ChunkPlan::new(values.len(), max_parameters)?;
    let mut statements = Vec::with_capacity(plan.prepared_statements());
    let mut rest = values.as_slice();

    if plan.full_chunks > 0 {
        let (head, tail) = rest.split_at(plan.chunk_size * plan.full_chunks);
        statements.push(BatchedStatement {
            sql: expand_template(template, plan.chunk_size),
            executions: head.chunks(plan.chunk_size).map(<[SqlValue]>::to_vec).collect(),
        });
        rest = tail;
    }

    if plan.remainder > 0 {
        statements.push(BatchedStatement::single(
            expand_template(template, plan.remainder),
            rest.to_vec(),
        ));
    }

    Ok(statements)
}

fn expand_template(template: &str, parameters: usize) -> String {
    template.replace(PARAMETER_LIST, &vec!["?"; parameters].join(", "))
}
