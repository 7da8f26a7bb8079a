//! Vindex resolution against live data.

use std::sync::Arc;

use super::{Ctx, Executor};
use crate::error::{GateError, GateResult};
use crate::key::KeyspaceId;
use crate::lookup::{LookupAdapter, LookupEntry};
use crate::session::Session;
use crate::value::Value;
use crate::vindex::Vindex;

impl Executor {
    /// Keyspace ids for each input tuple. Functional vindexes compute them;
    /// lookup vindexes read their backing table.
    pub(crate) async fn map_vindex(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        vindex: &Arc<Vindex>,
        inputs: &[Vec<Value>],
    ) -> GateResult<Vec<Vec<KeyspaceId>>> {
        if vindex.is_functional() {
            return inputs
                .iter()
                .map(|input| {
                    let [value] = input.as_slice() else {
                        return Err(GateError::vindex(format!(
                            "vindex {} takes one column, got {}",
                            vindex.name,
                            input.len()
                        )));
                    };
                    Ok(vindex.map_functional(value)?.into_iter().collect())
                })
                .collect();
        }

        let stored = LookupAdapter::new(self, ctx)
            .lookup(session, vindex, inputs)
            .await?;
        stored
            .into_iter()
            .zip(inputs)
            .map(|(values, input)| {
                let ksids: Vec<KeyspaceId> = values
                    .iter()
                    .filter_map(|value| vindex.ksid_from_stored(value))
                    .collect();
                if vindex.is_unique() && ksids.len() > 1 {
                    return Err(GateError::vindex(format!(
                        "unique vindex {} maps {} to {} keyspace ids",
                        vindex.name,
                        display_values(input),
                        ksids.len()
                    )));
                }
                Ok(ksids)
            })
            .collect()
    }

    /// Whether each entry's values map to its keyspace id.
    pub(crate) async fn verify_vindex(
        &self,
        session: &mut Session,
        ctx: &Ctx,
        vindex: &Arc<Vindex>,
        entries: &[LookupEntry],
    ) -> GateResult<Vec<bool>> {
        if vindex.is_functional() {
            let inputs: Vec<Vec<Value>> = entries.iter().map(|(values, _)| values.clone()).collect();
            let mapped = self.map_vindex(session, ctx, vindex, &inputs).await?;
            return Ok(entries
                .iter()
                .zip(mapped)
                .map(|((_, ksid), ksids)| ksids.contains(ksid))
                .collect());
        }
        LookupAdapter::new(self, ctx)
            .verify(session, vindex, entries)
            .await
    }
}

/// `(a, b)` rendering of a value tuple for error messages.
pub(crate) fn display_values(values: &[Value]) -> String {
    let parts: Vec<String> = values.iter().map(|v| v.to_string()).collect();
    if parts.len() == 1 {
        parts.into_iter().next().unwrap_or_default()
    } else {
        format!("({})", parts.join(", "))
    }
}
