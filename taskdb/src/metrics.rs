//! Build metrics (spec.md §3): post-completion rows keyed by
//! `hash(builder, spawn, project, ref)`, pruned to the most recent 10 per
//! key, used by the scheduler to estimate a task's cost.

use crate::error::{classify, TaskDbResult};
use rusqlite::{params, Connection};
use sai_lib::model::BuildMetricRow;

pub fn insert_metric(conn: &Connection, row: &BuildMetricRow) -> TaskDbResult<()> {
    conn.execute(
        "INSERT INTO build_metrics (key, unixtime, us_cpu_user, us_cpu_sys, peak_mem_rss,
            stg_bytes, parallel, step)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            row.key,
            row.unixtime,
            row.us_cpu_user,
            row.us_cpu_sys,
            row.peak_mem_rss,
            row.stg_bytes,
            row.parallel,
            row.step,
        ],
    )
    .map_err(classify)?;
    prune_to_most_recent(conn, &row.key, 10)?;
    Ok(())
}

fn prune_to_most_recent(conn: &Connection, key: &str, keep: u32) -> TaskDbResult<()> {
    conn.execute(
        "DELETE FROM build_metrics WHERE key = ?1 AND rowid NOT IN (
            SELECT rowid FROM build_metrics WHERE key = ?1 ORDER BY unixtime DESC LIMIT ?2
         )",
        params![key, keep],
    )
    .map_err(classify)?;
    Ok(())
}

/// Estimated peak memory / disk for a task, averaged over its most
/// recent historical metrics (feeds `est_peak_mem_kib`/`est_disk_kib`,
/// spec.md §3).
pub fn estimate(conn: &Connection, key: &str) -> TaskDbResult<Option<(i64, i64)>> {
    let mut stmt = conn.prepare(
        "SELECT AVG(peak_mem_rss), AVG(stg_bytes) FROM build_metrics WHERE key = ?1",
    )?;
    let mut rows = stmt.query(params![key])?;
    if let Some(row) = rows.next()? {
        let mem: Option<f64> = row.get(0)?;
        let stg: Option<f64> = row.get(1)?;
        if let (Some(mem), Some(stg)) = (mem, stg) {
            return Ok(Some(((mem / 1024.0) as i64, (stg / 1024.0) as i64)));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::GLOBAL_SCHEMA;

    fn fresh_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(GLOBAL_SCHEMA).unwrap();
        conn
    }

    #[test]
    fn prunes_to_ten_most_recent_per_key() {
        let conn = fresh_conn();
        let key = BuildMetricRow::key_for("builder1", "spawn1", "acme/widget", "refs/heads/main");
        for i in 0..15 {
            insert_metric(
                &conn,
                &BuildMetricRow {
                    key: key.clone(),
                    unixtime: i,
                    us_cpu_user: 1,
                    us_cpu_sys: 1,
                    peak_mem_rss: 1024 * (i + 1),
                    stg_bytes: 2048,
                    parallel: 1,
                    step: 3,
                },
            )
            .unwrap();
        }
        let count: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM build_metrics WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 10);
    }

    #[test]
    fn estimate_averages_recent_metrics() {
        let conn = fresh_conn();
        let key = BuildMetricRow::key_for("b", "s", "p", "r");
        insert_metric(
            &conn,
            &BuildMetricRow {
                key: key.clone(),
                unixtime: 1,
                us_cpu_user: 1,
                us_cpu_sys: 1,
                peak_mem_rss: 2048,
                stg_bytes: 4096,
                parallel: 1,
                step: 3,
            },
        )
        .unwrap();
        let (mem_kib, disk_kib) = estimate(&conn, &key).unwrap().unwrap();
        assert_eq!(mem_kib, 2);
        assert_eq!(disk_kib, 4);
    }
}
