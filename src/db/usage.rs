//! Token accounting for AI collaborator calls.

use std::collections::HashMap;

use super::*;

#[derive(Debug, Clone, Serialize, PartialEq, Eq, Default)]
pub struct ComponentUsage {
    pub calls: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LlmUsageSummary {
    pub total_calls: i64,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub today_calls: i64,
    pub by_component: HashMap<String, ComponentUsage>,
}

impl LinkDB {
    pub fn log_llm_call(
        &self,
        component: &str,
        model: &str,
        input_tokens: u32,
        output_tokens: u32,
        duration_ms: u64,
    ) -> Result<(), LinkNestError> {
        let c = self.conn()?;
        c.execute(
            "INSERT INTO llm_usage (ts, component, model, input_tokens, output_tokens, duration_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            rusqlite::params![now_ms(), component, model, input_tokens, output_tokens, duration_ms as i64],
        )?;
        Ok(())
    }

    pub fn llm_usage_summary(&self) -> Result<LlmUsageSummary, LinkNestError> {
        let c = self.conn()?;
        let today_start = {
            let now = now_ms();
            now - (now % 86_400_000)
        };

        let total: (i64, i64, i64) = c.query_row(
            "SELECT COUNT(*), COALESCE(SUM(input_tokens),0), COALESCE(SUM(output_tokens),0) FROM llm_usage",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )?;
        let today_calls: i64 = c.query_row(
            "SELECT COUNT(*) FROM llm_usage WHERE ts >= ?1",
            [today_start],
            |r| r.get(0),
        )?;

        let mut stmt = c.prepare(
            "SELECT component, COUNT(*), COALESCE(SUM(input_tokens),0), COALESCE(SUM(output_tokens),0) \
             FROM llm_usage GROUP BY component",
        )?;
        let by_component = stmt
            .query_map([], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    ComponentUsage {
                        calls: r.get(1)?,
                        input_tokens: r.get(2)?,
                        output_tokens: r.get(3)?,
                    },
                ))
            })?
            .collect::<Result<HashMap<_, _>, _>>()?;

        Ok(LlmUsageSummary {
            total_calls: total.0,
            total_input_tokens: total.1,
            total_output_tokens: total.2,
            today_calls,
            by_component,
        })
    }
}
