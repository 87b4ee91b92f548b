//! Session-final EWMA state in `threshold_history`, used to seed detectors
//! across process restarts.

use rusqlite::{params, Connection, OptionalExtension};

use super::EwmaState;
use crate::error::Result;
use crate::memory::now_timestamp;

/// Average of the last `sessions` checkpoints for `partition`, or `None`
/// without history.
pub fn seed(conn: &Connection, partition: &str, sessions: usize) -> Result<Option<EwmaState>> {
    if sessions == 0 {
        return Ok(None);
    }
    let (rows, distance, variance, observations): (i64, Option<f64>, Option<f64>, Option<i64>) =
        conn.query_row(
            "SELECT COUNT(*), AVG(ewma_distance), AVG(ewma_variance), MAX(observation_count) \
             FROM (SELECT ewma_distance, ewma_variance, observation_count \
                   FROM threshold_history WHERE partition_key = ?1 \
                   ORDER BY id DESC LIMIT ?2)",
            params![partition, sessions as i64],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

    match (rows, distance, variance) {
        (n, Some(distance), Some(variance)) if n > 0 => {
            tracing::debug!(partition, sessions = n, distance, variance, "seeded threshold state");
            Ok(Some(EwmaState {
                distance,
                variance,
                observations: observations.unwrap_or(0).max(0) as u64,
            }))
        }
        _ => Ok(None),
    }
}

/// The checkpointed state of one session, if any.
pub fn for_session(conn: &Connection, session_id: &str) -> Result<Option<EwmaState>> {
    let state = conn
        .query_row(
            "SELECT ewma_distance, ewma_variance, observation_count \
             FROM threshold_history WHERE session_id = ?1",
            [session_id],
            |row| {
                Ok(EwmaState {
                    distance: row.get(0)?,
                    variance: row.get(1)?,
                    observations: row.get::<_, i64>(2)?.max(0) as u64,
                })
            },
        )
        .optional()?;
    Ok(state)
}

/// Record the final state of `session_id`. Re-checkpointing a session
/// replaces its row.
pub fn checkpoint(conn: &Connection, partition: &str, session_id: &str, state: &EwmaState) -> Result<()> {
    conn.execute(
        "INSERT INTO threshold_history \
             (partition_key, session_id, ewma_distance, ewma_variance, observation_count, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
         ON CONFLICT(session_id) DO UPDATE SET \
             ewma_distance = excluded.ewma_distance, \
             ewma_variance = excluded.ewma_variance, \
             observation_count = excluded.observation_count, \
             created_at = excluded.created_at",
        params![
            partition,
            session_id,
            state.distance,
            state.variance,
            i64::try_from(state.observations).unwrap_or(i64::MAX),
            now_timestamp(),
        ],
    )?;
    tracing::debug!(partition, session_id, distance = state.distance, "threshold checkpoint");
    Ok(())
}
