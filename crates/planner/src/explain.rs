use crate::planner::QueryPlan;

/// Render a plan as human-readable multiline text.
pub fn explain_plan(plan: &QueryPlan) -> String {
    let mut out = String::new();
    out.push_str("Tables\n");
    for t in &plan.tables {
        out.push_str(&format!(
            "  {} rows={} row_groups={} disk_mb={:.3} est_mb={:.3}\n",
            t.name,
            t.metadata.rows,
            t.metadata.row_groups,
            t.metadata.disk_mb(),
            t.estimated_mb
        ));
        out.push_str(&format!("    columns={:?}\n", t.columns));
    }
    out.push_str("Joins\n");
    for (i, s) in plan.steps.iter().enumerate() {
        let left = if i == 0 {
            s.left.clone()
        } else {
            format!("step{i}")
        };
        out.push_str(&format!(
            "  step{} {} {left}.{} = {}.{} est_mb={:.3}\n",
            i + 1,
            s.algorithm,
            s.left_key,
            s.right,
            s.right_key,
            s.estimated_mb
        ));
    }
    out
}
