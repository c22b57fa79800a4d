//! Owning-record collaborator operations.
//!
//! The queue reads and writes only the status, the kind discriminator, and
//! the output/error payload columns of a base record; everything else about
//! results and procedures belongs to the record-specific layers.

use sqlx::Row;

use super::{
    Database, DbError, DbResult, OwningRecordRef, RecordId, RecordKind, RecordStatus,
};

impl Database {
    /// Create a base record in `waiting` status. Seam for the facade and for
    /// tests; real result/procedure rows carry far more than this layer
    /// touches.
    pub async fn add_record(&self, kind: RecordKind) -> DbResult<RecordId> {
        let row = sqlx::query(
            "INSERT INTO base_records (record_type, status) VALUES ($1, 'waiting') RETURNING id",
        )
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;
        Ok(RecordId(row.get("id")))
    }

    /// Resolve a record id to its typed reference.
    pub async fn get_owning_ref(&self, id: RecordId) -> DbResult<OwningRecordRef> {
        let row = sqlx::query("SELECT record_type FROM base_records WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("base record {id}")))?;

        let kind: String = row.get("record_type");
        let kind = RecordKind::parse(&kind)
            .ok_or_else(|| DbError::Corrupt(format!("unknown record type {kind:?}")))?;
        Ok(OwningRecordRef::from_parts(kind, id))
    }

    /// Update a record's status, optionally attaching an error payload.
    /// Returns false if no such record exists.
    pub async fn set_record_status(
        &self,
        id: RecordId,
        status: RecordStatus,
        error_payload: Option<&serde_json::Value>,
    ) -> DbResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE base_records
            SET status = $2, error_payload = COALESCE($3, error_payload), modified_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.0)
        .bind(status.as_str())
        .bind(error_payload)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Read a record's status.
    pub async fn get_record_status(&self, id: RecordId) -> DbResult<RecordStatus> {
        let row = sqlx::query("SELECT status FROM base_records WHERE id = $1")
            .bind(id.0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("base record {id}")))?;

        let status: String = row.get("status");
        RecordStatus::parse(&status)
            .ok_or_else(|| DbError::Corrupt(format!("unknown record status {status:?}")))
    }

    /// Persist a finished computation onto its owning record and mark it
    /// complete. The output lands in the kind-specific column.
    pub(crate) async fn store_record_output(
        &self,
        record: &OwningRecordRef,
        output: &serde_json::Value,
    ) -> DbResult<bool> {
        let result = match record {
            OwningRecordRef::Result(id) => {
                sqlx::query(
                    r#"
                    UPDATE base_records
                    SET status = 'complete', return_result = $2, modified_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id.0)
                .bind(output)
                .execute(&self.pool)
                .await?
            }
            OwningRecordRef::Procedure(id) => {
                sqlx::query(
                    r#"
                    UPDATE base_records
                    SET status = 'complete', outputs = $2, modified_at = NOW()
                    WHERE id = $1
                    "#,
                )
                .bind(id.0)
                .bind(output)
                .execute(&self.pool)
                .await?
            }
        };

        Ok(result.rows_affected() == 1)
    }

    /// Read back the kind-specific output column. None until the record
    /// completes.
    pub async fn get_record_output(
        &self,
        record: &OwningRecordRef,
    ) -> DbResult<Option<serde_json::Value>> {
        let column = match record {
            OwningRecordRef::Result(_) => "return_result",
            OwningRecordRef::Procedure(_) => "outputs",
        };
        let sql = format!("SELECT {column} FROM base_records WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(record.id().0)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("base record {}", record.id())))?;

        Ok(row.get(column))
    }
}
