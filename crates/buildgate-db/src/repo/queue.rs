//! Deferral queue on PostgreSQL.
//!
//! Visibility is a `visible_at` timestamp: a receive claims rows with
//! `FOR UPDATE SKIP LOCKED`, pushes `visible_at` forward by the visibility
//! timeout and issues a fresh receipt handle. Rows least recently received
//! are handed out first, so zero-timeout peeks walk the whole queue.

use async_trait::async_trait;
use buildgate_core::queue::{
    DEDUP_INTERVAL, DEFAULT_VISIBILITY_TIMEOUT, MAX_RECEIVE_BATCH, MessageAttributes,
    OutgoingMessage, QueueTransport, ReceiveRequest, ReceivedMessage,
};
use sqlx::PgPool;
use sqlx::types::Json;
use tracing::debug;
use uuid::Uuid;

use crate::{DbError, DbResult};

#[derive(Debug, sqlx::FromRow)]
struct MessageRow {
    id: Uuid,
    receipt_handle: Option<Uuid>,
    attributes: Json<MessageAttributes>,
}

/// PostgreSQL implementation of QueueTransport. Queue URLs are queue names.
pub struct PgQueueTransport {
    pool: PgPool,
}

impl PgQueueTransport {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn create(&self, name: &str) -> DbResult<String> {
        sqlx::query("INSERT INTO deferral_queues (name) VALUES ($1) ON CONFLICT (name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(name.to_string())
    }

    async fn enqueue(&self, queue: &str, message: OutgoingMessage) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        let purged = sqlx::query(
            r#"
            DELETE FROM deferral_dedup
            WHERE queue_name = $1 AND accepted_at < NOW() - make_interval(secs => $2)
            "#,
        )
        .bind(queue)
        .bind(DEDUP_INTERVAL.as_secs_f64())
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if purged > 0 {
            debug!(queue = %queue, purged, "Purged expired dedup tokens");
        }

        if let Some(token) = &message.deduplication_id {
            // A token inside the window conflicts and the guarded update
            // touches nothing, so no row comes back.
            let accepted: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO deferral_dedup (queue_name, dedup_id, accepted_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (queue_name, dedup_id) DO UPDATE
                    SET accepted_at = EXCLUDED.accepted_at
                    WHERE deferral_dedup.accepted_at < NOW() - make_interval(secs => $3)
                RETURNING dedup_id
                "#,
            )
            .bind(queue)
            .bind(token)
            .bind(DEDUP_INTERVAL.as_secs_f64())
            .fetch_optional(&mut *tx)
            .await?;

            if accepted.is_none() {
                tx.commit().await?;
                debug!(queue = %queue, dedup_id = %token, "Dropped duplicate message");
                return Ok(());
            }
        }

        let delay = message.delay.map(|d| d.as_secs_f64()).unwrap_or(0.0);
        sqlx::query(
            r#"
            INSERT INTO deferral_messages (id, queue_name, attributes, visible_at)
            VALUES ($1, $2, $3, NOW() + make_interval(secs => $4))
            "#,
        )
        .bind(Uuid::now_v7())
        .bind(queue)
        .bind(Json(&message.attributes))
        .bind(delay)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn claim(&self, queue: &str, request: ReceiveRequest) -> DbResult<Vec<ReceivedMessage>> {
        let limit = request.max_messages.min(MAX_RECEIVE_BATCH) as i64;
        let hidden_for = request
            .visibility_timeout
            .unwrap_or(DEFAULT_VISIBILITY_TIMEOUT)
            .as_secs_f64();

        let rows = sqlx::query_as::<_, MessageRow>(
            r#"
            UPDATE deferral_messages
            SET receipt_handle = gen_random_uuid(),
                visible_at = NOW() + make_interval(secs => $3),
                last_received_at = clock_timestamp()
            WHERE id IN (
                SELECT id FROM deferral_messages
                WHERE queue_name = $1 AND visible_at <= NOW()
                ORDER BY last_received_at ASC NULLS FIRST, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT $2
            )
            RETURNING id, receipt_handle, attributes
            "#,
        )
        .bind(queue)
        .bind(limit)
        .bind(hidden_for)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> DbResult<ReceivedMessage> {
                let handle = row.receipt_handle.ok_or_else(|| {
                    DbError::NotFound(format!("receipt handle for message {}", row.id))
                })?;
                Ok(ReceivedMessage {
                    message_id: row.id.to_string(),
                    receipt_handle: handle.to_string(),
                    attributes: row.attributes.0,
                })
            })
            .collect()
    }

    async fn remove(&self, queue: &str, receipt_handle: &str) -> DbResult<()> {
        let handle = Uuid::parse_str(receipt_handle).map_err(|e| {
            DbError::InvalidInput(format!("receipt handle '{}': {}", receipt_handle, e))
        })?;
        sqlx::query("DELETE FROM deferral_messages WHERE queue_name = $1 AND receipt_handle = $2")
            .bind(queue)
            .bind(handle)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn visible_count(&self, queue: &str) -> DbResult<usize> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM deferral_messages WHERE queue_name = $1 AND visible_at <= NOW()",
        )
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as usize)
    }
}

#[async_trait]
impl QueueTransport for PgQueueTransport {
    async fn create_queue(&self, name: &str) -> buildgate_core::Result<String> {
        Ok(self.create(name).await?)
    }

    async fn send(&self, queue_url: &str, message: OutgoingMessage) -> buildgate_core::Result<()> {
        Ok(self.enqueue(queue_url, message).await?)
    }

    async fn receive(
        &self,
        queue_url: &str,
        request: ReceiveRequest,
    ) -> buildgate_core::Result<Vec<ReceivedMessage>> {
        Ok(self.claim(queue_url, request).await?)
    }

    async fn delete(&self, queue_url: &str, receipt_handle: &str) -> buildgate_core::Result<()> {
        Ok(self.remove(queue_url, receipt_handle).await?)
    }

    async fn approximate_message_count(&self, queue_url: &str) -> buildgate_core::Result<usize> {
        Ok(self.visible_count(queue_url).await?)
    }
}

/// Integration tests that require PostgreSQL.
/// Run with: DATABASE_URL=... cargo test -- --ignored
#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::{create_pool, run_migrations};
    use buildgate_core::Deferral;

    async fn transport() -> (PgQueueTransport, String) {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
        let pool = create_pool(&url).await.unwrap();
        run_migrations(&pool).await.unwrap();
        let transport = PgQueueTransport::new(pool);
        let queue = transport
            .create_queue(&format!("test-{}", Uuid::new_v4()))
            .await
            .unwrap();
        (transport, queue)
    }

    #[tokio::test]
    #[ignore]
    async fn test_send_receive_delete() {
        let (transport, queue) = transport().await;
        let deferral = Deferral::new("team/lib", "master", Uuid::new_v4().to_string(), 42);
        transport.send(&queue, deferral.to_message(None)).await.unwrap();
        assert_eq!(transport.approximate_message_count(&queue).await.unwrap(), 1);

        let received = transport
            .receive(&queue, ReceiveRequest::batch(10))
            .await
            .unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(Deferral::from_message(&received[0]).unwrap(), deferral);
        assert_eq!(transport.approximate_message_count(&queue).await.unwrap(), 0);

        transport
            .delete(&queue, &received[0].receipt_handle)
            .await
            .unwrap();
    }

    #[tokio::test]
    #[ignore]
    async fn test_duplicate_token_dropped() {
        let (transport, queue) = transport().await;
        let deferral = Deferral::new("team/lib", "master", "same-build", 42);
        transport.send(&queue, deferral.to_message(None)).await.unwrap();
        transport.send(&queue, deferral.to_message(None)).await.unwrap();
        assert_eq!(transport.approximate_message_count(&queue).await.unwrap(), 1);
    }

    #[tokio::test]
    #[ignore]
    async fn test_expired_dedup_tokens_are_purged() {
        let (transport, queue) = transport().await;
        sqlx::query(
            r#"
            INSERT INTO deferral_dedup (queue_name, dedup_id, accepted_at)
            VALUES ($1, 'stale', NOW() - INTERVAL '1 hour')
            "#,
        )
        .bind(&queue)
        .execute(&transport.pool)
        .await
        .unwrap();

        let deferral = Deferral::new("team/lib", "master", Uuid::new_v4().to_string(), 42);
        transport.send(&queue, deferral.to_message(None)).await.unwrap();

        let tokens: Vec<String> =
            sqlx::query_scalar("SELECT dedup_id FROM deferral_dedup WHERE queue_name = $1")
                .bind(&queue)
                .fetch_all(&transport.pool)
                .await
                .unwrap();
        assert_eq!(tokens, vec![deferral.build_id.clone()]);
    }

    #[tokio::test]
    #[ignore]
    async fn test_peek_leaves_messages_visible() {
        let (transport, queue) = transport().await;
        let deferral = Deferral::new("team/lib", "master", Uuid::new_v4().to_string(), 42);
        transport.send(&queue, deferral.to_message(None)).await.unwrap();

        let peeked = transport
            .receive(&queue, ReceiveRequest::peek(10))
            .await
            .unwrap();
        assert_eq!(peeked.len(), 1);
        assert_eq!(transport.approximate_message_count(&queue).await.unwrap(), 1);
    }
}
