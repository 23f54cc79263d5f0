use std::time::Duration;

use sqlx::Row;
use time::OffsetDateTime;

use crate::database::custom_types::{MessageId, PopReceipt};
use crate::database::Database;

/// Visibility-timeout message queue. Messages are pointers into the entity
/// table, never authoritative state: receiving hides a message until its
/// visibility deadline, and each receive or renewal rotates the pop receipt so
/// stale holders can be detected and refused.
#[derive(Clone)]
pub struct MessageQueue {
    database: Database,
    queue_name: String,
}

#[derive(Clone, Debug)]
pub struct QueueMessage {
    pub message_id: MessageId,
    pub pop_receipt: PopReceipt,
    pub body: String,
    pub dequeue_count: i64,
}

impl MessageQueue {
    pub fn new(database: Database, queue_name: impl ToString) -> Self {
        Self {
            database,
            queue_name: queue_name.to_string(),
        }
    }

    pub async fn send(&self, body: &str) -> Result<(MessageId, PopReceipt), MessageQueueError> {
        let message_id = MessageId::generate();
        let pop_receipt = PopReceipt::generate();

        sqlx::query(
            "INSERT INTO queue_messages (message_id, queue_name, body, pop_receipt, visible_at, dequeue_count, enqueued_at)
                 VALUES ($1, $2, $3, $4, $5, 0, $6);",
        )
        .bind(message_id.to_string())
        .bind(&self.queue_name)
        .bind(body)
        .bind(pop_receipt.to_string())
        .bind(now_micros())
        .bind(OffsetDateTime::now_utc())
        .execute(&*self.database)
        .await
        .map_err(MessageQueueError::QueryFailed)?;

        Ok((message_id, pop_receipt))
    }

    /// Takes the next visible message off the queue, hiding it for the given
    /// visibility window. Returns `None` when nothing is ready.
    pub async fn receive(
        &self,
        visibility: Duration,
    ) -> Result<Option<QueueMessage>, MessageQueueError> {
        let mut transaction = self
            .database
            .begin()
            .await
            .map_err(MessageQueueError::Transaction)?;

        let candidate = sqlx::query(
            "SELECT message_id, body, dequeue_count FROM queue_messages
                 WHERE queue_name = $1 AND visible_at <= $2
                 ORDER BY visible_at ASC
                 LIMIT 1;",
        )
        .bind(&self.queue_name)
        .bind(now_micros())
        .fetch_optional(&mut *transaction)
        .await
        .map_err(MessageQueueError::QueryFailed)?;

        let row = match candidate {
            Some(row) => row,
            None => return Ok(None),
        };

        let raw_id: String = row.try_get("message_id").map_err(MessageQueueError::QueryFailed)?;
        let message_id = MessageId::try_from(raw_id.as_str())
            .map_err(|_| MessageQueueError::CorruptMessage(raw_id.clone()))?;
        let body: String = row.try_get("body").map_err(MessageQueueError::QueryFailed)?;
        let dequeue_count: i64 = row
            .try_get("dequeue_count")
            .map_err(MessageQueueError::QueryFailed)?;

        let pop_receipt = PopReceipt::generate();
        let invisible_until = now_micros() + duration_micros(visibility);

        sqlx::query(
            "UPDATE queue_messages
                 SET pop_receipt = $1, visible_at = $2, dequeue_count = dequeue_count + 1
                 WHERE message_id = $3;",
        )
        .bind(pop_receipt.to_string())
        .bind(invisible_until)
        .bind(&raw_id)
        .execute(&mut *transaction)
        .await
        .map_err(MessageQueueError::QueryFailed)?;

        transaction
            .commit()
            .await
            .map_err(MessageQueueError::Transaction)?;

        Ok(Some(QueueMessage {
            message_id,
            pop_receipt,
            body,
            dequeue_count: dequeue_count + 1,
        }))
    }

    /// Extends the invisibility of a held message, rotating its receipt. The
    /// presented receipt must still be current.
    pub async fn renew(
        &self,
        message_id: MessageId,
        pop_receipt: PopReceipt,
        visibility: Duration,
    ) -> Result<PopReceipt, MessageQueueError> {
        let fresh_receipt = PopReceipt::generate();
        let invisible_until = now_micros() + duration_micros(visibility);

        let outcome = sqlx::query(
            "UPDATE queue_messages SET pop_receipt = $1, visible_at = $2
                 WHERE message_id = $3 AND pop_receipt = $4;",
        )
        .bind(fresh_receipt.to_string())
        .bind(invisible_until)
        .bind(message_id.to_string())
        .bind(pop_receipt.to_string())
        .execute(&*self.database)
        .await
        .map_err(MessageQueueError::QueryFailed)?;

        if outcome.rows_affected() == 0 {
            return Err(self.missed_write(message_id).await);
        }

        Ok(fresh_receipt)
    }

    pub async fn delete(
        &self,
        message_id: MessageId,
        pop_receipt: PopReceipt,
    ) -> Result<(), MessageQueueError> {
        let outcome = sqlx::query(
            "DELETE FROM queue_messages WHERE message_id = $1 AND pop_receipt = $2;",
        )
        .bind(message_id.to_string())
        .bind(pop_receipt.to_string())
        .execute(&*self.database)
        .await
        .map_err(MessageQueueError::QueryFailed)?;

        if outcome.rows_affected() == 0 {
            return Err(self.missed_write(message_id).await);
        }

        Ok(())
    }

    async fn missed_write(&self, message_id: MessageId) -> MessageQueueError {
        let exists = sqlx::query("SELECT 1 FROM queue_messages WHERE message_id = $1;")
            .bind(message_id.to_string())
            .fetch_optional(&*self.database)
            .await;

        match exists {
            Ok(Some(_)) => MessageQueueError::PopReceiptMismatch(message_id),
            Ok(None) => MessageQueueError::MessageNotFound(message_id),
            Err(err) => MessageQueueError::QueryFailed(err),
        }
    }
}

fn duration_micros(duration: Duration) -> i64 {
    duration.as_micros().min(i64::MAX as u128) as i64
}

fn now_micros() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000) as i64
}

#[derive(Debug, thiserror::Error)]
pub enum MessageQueueError {
    #[error("queue message {0} carried an unusable identifier")]
    CorruptMessage(String),

    #[error("no queue message found with id {0}")]
    MessageNotFound(MessageId),

    #[error("pop receipt for message {0} is no longer current")]
    PopReceiptMismatch(MessageId),

    #[error("queue backend query failed: {0}")]
    QueryFailed(sqlx::Error),

    #[error("an error occurred with a transaction operation: {0}")]
    Transaction(sqlx::Error),
}

impl MessageQueueError {
    /// A lost message or stale receipt means the lease is gone, not that the
    /// operation should be repeated.
    pub fn is_lease_lost(&self) -> bool {
        matches!(
            self,
            MessageQueueError::MessageNotFound(_) | MessageQueueError::PopReceiptMismatch(_)
        )
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tests::helpers::test_database;

    #[tokio::test]
    async fn test_received_message_is_hidden() {
        let queue = MessageQueue::new(test_database().await, "jobs-000");

        queue.send("first").await.expect("send");

        let message = queue
            .receive(Duration::from_secs(30))
            .await
            .expect("receive")
            .expect("a message");
        assert_eq!(message.body, "first");
        assert_eq!(message.dequeue_count, 1);

        // hidden until the visibility window lapses
        let followup = queue.receive(Duration::from_secs(30)).await.expect("receive");
        assert!(followup.is_none());
    }

    #[tokio::test]
    async fn test_message_reappears_after_visibility_lapse() {
        let queue = MessageQueue::new(test_database().await, "jobs-000");

        queue.send("retry me").await.expect("send");

        let first = queue
            .receive(Duration::from_millis(5))
            .await
            .expect("receive")
            .expect("a message");

        tokio::time::sleep(Duration::from_millis(25)).await;

        let second = queue
            .receive(Duration::from_secs(30))
            .await
            .expect("receive")
            .expect("reappeared");

        assert_eq!(second.message_id, first.message_id);
        assert_eq!(second.dequeue_count, 2);

        // the earlier receipt was superseded by the second receive
        let err = queue
            .delete(first.message_id, first.pop_receipt)
            .await
            .unwrap_err();
        assert!(matches!(err, MessageQueueError::PopReceiptMismatch(_)));
    }

    #[tokio::test]
    async fn test_renew_rotates_receipt() {
        let queue = MessageQueue::new(test_database().await, "jobs-000");

        queue.send("busy job").await.expect("send");
        let message = queue
            .receive(Duration::from_secs(30))
            .await
            .expect("receive")
            .expect("a message");

        let fresh = queue
            .renew(message.message_id, message.pop_receipt, Duration::from_secs(30))
            .await
            .expect("renew");

        let stale = queue
            .renew(message.message_id, message.pop_receipt, Duration::from_secs(30))
            .await;
        assert!(matches!(
            stale,
            Err(MessageQueueError::PopReceiptMismatch(_))
        ));

        queue
            .delete(message.message_id, fresh)
            .await
            .expect("delete with fresh receipt");

        let gone = queue
            .delete(message.message_id, fresh)
            .await
            .unwrap_err();
        assert!(matches!(gone, MessageQueueError::MessageNotFound(_)));
    }
}
