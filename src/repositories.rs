use crate::{
    aggregate::{self, FlagPolicy, VoteTransition},
    db::{self, n, s, Item, TableNames, COMMENTS_BY_MEME_INDEX},
    domain::{CommentRepository, IdentityResolver, MemeRepository},
    errors::RepoError,
    models::{Comment, Flag, FlagOutcome, Identity, Meme, MemePatch, Vote, VoteOutcome, VoteType},
};
use anyhow::Context;
use async_trait::async_trait;
use aws_sdk_dynamodb::{
    error::SdkError,
    operation::{
        transact_write_items::TransactWriteItemsError,
        update_item::{builders::UpdateItemFluentBuilder, UpdateItemError, UpdateItemOutput},
    },
    types::{
        AttributeValue, CancellationReason, Delete, DeleteRequest, Put, ReturnValue,
        ReturnValuesOnConditionCheckFailure, TransactWriteItem, Update, WriteRequest,
    },
    Client as DynamoDbClient,
};
use backoff::{future::retry, ExponentialBackoffBuilder};
use chrono::{DateTime, Utc};
use std::{collections::HashMap, time::Duration};
use tracing::{self, info};
use uuid::Uuid;

/// DynamoDB accepts at most 25 requests per BatchWriteItem call.
const BATCH_WRITE_LIMIT: usize = 25;
const MAX_UNPROCESSED_ROUNDS: usize = 5;
/// A flag update is re-sent at most this often when its flag-count guard misses.
const MAX_FLAG_ATTEMPTS: usize = 4;
/// Position of the meme counter update inside a vote transaction.
const VOTE_COUNTERS_INDEX: usize = 1;

fn meme_key(id: Uuid) -> (String, AttributeValue) {
    ("meme_id".to_string(), s(id.to_string()))
}

/// Runs a Scan or Query page by page, handing every item to `on_item`.
macro_rules! for_each_page {
    ($request:expr, $context:expr, |$item:ident| $body:block) => {{
        let mut last_evaluated_key: Option<Item> = None;
        loop {
            let resp = $request
                .set_exclusive_start_key(last_evaluated_key.take())
                .send()
                .await
                .context($context)
                .map_err(RepoError::BackendError)?;
            for $item in resp.items.unwrap_or_default() {
                $body
            }
            last_evaluated_key = resp.last_evaluated_key;
            if last_evaluated_key.is_none() {
                break;
            }
        }
    }};
}

/// Deletes `keys` from `table` with BatchWriteItem, re-sending unprocessed
/// requests a bounded number of times.
async fn batch_delete(client: &DynamoDbClient, table: &str, keys: Vec<Item>) -> Result<(), RepoError> {
    for chunk in keys.chunks(BATCH_WRITE_LIMIT) {
        let mut pending = chunk
            .iter()
            .map(|key| -> Result<WriteRequest, RepoError> {
                Ok(WriteRequest::builder()
                    .delete_request(DeleteRequest::builder().set_key(Some(key.clone())).build()?)
                    .build())
            })
            .collect::<Result<Vec<_>, RepoError>>()?;

        for round in 0..MAX_UNPROCESSED_ROUNDS {
            if pending.is_empty() {
                break;
            }
            let resp = client
                .batch_write_item()
                .request_items(table, pending)
                .send()
                .await
                .context(format!("DynamoDB (table: {}): Batch delete failed", table))
                .map_err(RepoError::BackendError)?;
            pending = resp
                .unprocessed_items
                .and_then(|mut items| items.remove(table))
                .unwrap_or_default();
            if !pending.is_empty() {
                tracing::debug!(table, round, remaining = pending.len(), "DynamoDB: Retrying unprocessed deletes");
                tokio::time::sleep(Duration::from_millis(50 << round)).await;
            }
        }
        if !pending.is_empty() {
            return Err(RepoError::Contention(format!(
                "{} deletes left unprocessed in table '{}'",
                pending.len(),
                table
            )));
        }
    }
    Ok(())
}

/// What one optimistic vote attempt ran into.
enum VoteAttemptError {
    /// Another writer changed the vote row between our read and our write.
    Raced,
    Fatal(RepoError),
}

impl From<RepoError> for VoteAttemptError {
    fn from(err: RepoError) -> Self {
        VoteAttemptError::Fatal(err)
    }
}

fn vote_row_key(id: Uuid, user_id: &str) -> Item {
    HashMap::from([meme_key(id), ("user_id".to_string(), s(user_id))])
}

/// The conditional write that moves one vote row from `current` to `next`.
fn vote_row_write(
    table: &str,
    id: Uuid,
    user_id: &str,
    current: Option<VoteType>,
    next: Option<VoteType>,
) -> Result<TransactWriteItem, RepoError> {
    let item = match (current, next) {
        (None, Some(next)) => {
            let mut row = vote_row_key(id, user_id);
            row.insert("vote_type".to_string(), s(next.as_str()));
            TransactWriteItem::builder()
                .put(
                    Put::builder()
                        .table_name(table)
                        .set_item(Some(row))
                        .condition_expression("attribute_not_exists(user_id)")
                        .build()?,
                )
                .build()
        }
        (Some(current), Some(next)) => TransactWriteItem::builder()
            .update(
                Update::builder()
                    .table_name(table)
                    .set_key(Some(vote_row_key(id, user_id)))
                    .update_expression("SET vote_type = :next")
                    .condition_expression("vote_type = :current")
                    .expression_attribute_values(":next", s(next.as_str()))
                    .expression_attribute_values(":current", s(current.as_str()))
                    .build()?,
            )
            .build(),
        (Some(current), None) => TransactWriteItem::builder()
            .delete(
                Delete::builder()
                    .table_name(table)
                    .set_key(Some(vote_row_key(id, user_id)))
                    .condition_expression("vote_type = :current")
                    .expression_attribute_values(":current", s(current.as_str()))
                    .build()?,
            )
            .build(),
        (None, None) => {
            return Err(RepoError::DataCorruption(
                "vote transition from no vote to no vote".to_string(),
            ))
        }
    };
    Ok(item)
}

/// The meme side of a vote transaction: both counter deltas, guarded on the
/// meme still existing.
fn vote_counters_write(table: &str, id: Uuid, step: &VoteTransition) -> Result<TransactWriteItem, RepoError> {
    let (key, value) = meme_key(id);
    Ok(TransactWriteItem::builder()
        .update(
            Update::builder()
                .table_name(table)
                .key(key, value)
                .update_expression("ADD upvotes :up, downvotes :down")
                .condition_expression("attribute_exists(meme_id)")
                .expression_attribute_values(":up", n(step.upvotes_delta))
                .expression_attribute_values(":down", n(step.downvotes_delta))
                .build()?,
        )
        .build())
}

/// Why a vote transaction was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum VoteCancellation {
    /// The counter update's `attribute_exists(meme_id)` guard failed.
    MemeMissing,
    /// The vote row changed under us, or DynamoDB reported a conflict.
    Raced,
}

fn classify_cancellation(reasons: &[CancellationReason]) -> VoteCancellation {
    let meme_missing = reasons
        .get(VOTE_COUNTERS_INDEX)
        .and_then(|r| r.code())
        .is_some_and(|code| code == "ConditionalCheckFailed");
    if meme_missing {
        VoteCancellation::MemeMissing
    } else {
        VoteCancellation::Raced
    }
}

/// Result of a `comment_count > 0` guard failing: the meme is either at zero
/// already (report its count) or gone.
fn clamped_comment_count(id: Uuid, old: Option<&Item>) -> Result<u64, RepoError> {
    match old {
        Some(old) => Ok(db::get_counter(old, "comment_count").unwrap_or(0)),
        None => Err(RepoError::NotFound(id)),
    }
}

/// One UpdateItem's expressions together with every value they reference.
#[derive(Debug)]
struct ConditionalUpdate {
    update: String,
    condition: String,
    values: Item,
}

/// Appends `flag` and bumps `flag_count`. With `raise` the same write also
/// sets `is_flagged`. The flag-count guard rejects the write whenever `raise`
/// disagrees with the count it would produce.
fn flag_update(flag: &Flag, policy: FlagPolicy, raise: bool) -> ConditionalUpdate {
    let threshold = policy.threshold.max(1);
    let mut update = String::from("SET flags = list_append(if_not_exists(flags, :empty), :flag)");
    let mut condition = String::from("attribute_exists(meme_id)");
    let mut values = HashMap::from([
        (":empty".to_string(), AttributeValue::L(Vec::new())),
        (":flag".to_string(), db::flag_list(flag)),
        (":one".to_string(), n(1)),
        (":users".to_string(), AttributeValue::Ss(vec![flag.user_id.clone()])),
    ]);

    if policy.once_per_user {
        condition.push_str(" AND NOT contains(flagged_by, :user)");
        values.insert(":user".to_string(), s(&flag.user_id));
    }
    if raise {
        update.push_str(", is_flagged = :yes");
        values.insert(":yes".to_string(), AttributeValue::Bool(true));
    }
    if threshold > 1 {
        condition.push_str(if raise {
            " AND flag_count >= :floor"
        } else {
            " AND (attribute_not_exists(flag_count) OR flag_count < :floor)"
        });
        values.insert(":floor".to_string(), n(threshold - 1));
    }
    update.push_str(" ADD flag_count :one, flagged_by :users");

    ConditionalUpdate {
        update,
        condition,
        values,
    }
}

/// What a failed flag update tells us to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlagRetry {
    NotFound,
    AlreadyFlagged,
    /// Only the flag-count guard missed; try again with this `raise`.
    Again { raise: bool },
}

fn flag_rejection(flag: &Flag, policy: FlagPolicy, old: Option<&Item>) -> FlagRetry {
    let Some(old) = old else {
        return FlagRetry::NotFound;
    };
    let already = match old.get("flagged_by") {
        Some(AttributeValue::Ss(users)) => users.contains(&flag.user_id),
        _ => false,
    };
    if policy.once_per_user && already {
        return FlagRetry::AlreadyFlagged;
    }
    let count = db::get_counter(old, "flag_count").unwrap_or(0);
    FlagRetry::Again {
        raise: count + 1 >= policy.threshold.max(1),
    }
}

#[derive(Debug, Clone)]
pub struct DynamoDbMemeRepository {
    client: DynamoDbClient,
    tables: TableNames,
}

impl DynamoDbMemeRepository {
    pub fn new(client: DynamoDbClient, tables: TableNames) -> Self {
        info!(memes = %tables.memes, votes = %tables.votes, "Initializing DynamoDbMemeRepository");
        Self { client, tables }
    }

    /// Conditional UpdateItem on an existing meme. When the condition fails,
    /// the old item (if any) is handed back so callers can tell a missing
    /// meme from a failed guard.
    async fn update_meme(
        &self,
        id: Uuid,
        update: UpdateItemFluentBuilder,
        what: &str,
    ) -> Result<Result<UpdateItemOutput, Option<Item>>, RepoError> {
        let (key, value) = meme_key(id);
        let result = update
            .table_name(&self.tables.memes)
            .key(key, value)
            .return_values_on_condition_check_failure(ReturnValuesOnConditionCheckFailure::AllOld)
            .send()
            .await;
        match result {
            Ok(output) => Ok(Ok(output)),
            Err(SdkError::ServiceError(service_err)) => match service_err.into_err() {
                UpdateItemError::ConditionalCheckFailedException(e) => Ok(Err(e.item().cloned())),
                other => Err(RepoError::BackendError(anyhow::Error::new(other).context(format!(
                    "DynamoDB (table: {}): Failed to {} (id: {})",
                    self.tables.memes, what, id
                )))),
            },
            Err(e) => Err(RepoError::BackendError(anyhow::Error::new(e).context(format!(
                "DynamoDB (table: {}): Failed to {} (id: {})",
                self.tables.memes, what, id
            )))),
        }
    }

    /// Reads one counter out of an UPDATED_NEW / ALL_NEW response.
    fn counter_from(&self, id: Uuid, output: &UpdateItemOutput, field: &str) -> Result<u64, RepoError> {
        output
            .attributes()
            .and_then(|attrs| db::get_counter(attrs, field))
            .ok_or_else(|| RepoError::DataCorruption(format!("meme {} returned no readable '{}'", id, field)))
    }

    async fn increment(&self, id: Uuid, field: &str) -> Result<u64, RepoError> {
        let update = self
            .client
            .update_item()
            .update_expression("ADD #field :one")
            .condition_expression("attribute_exists(meme_id)")
            .expression_attribute_names("#field", field)
            .expression_attribute_values(":one", n(1))
            .return_values(ReturnValue::UpdatedNew);
        match self.update_meme(id, update, &format!("increment {}", field)).await? {
            Ok(output) => self.counter_from(id, &output, field),
            Err(_) => Err(RepoError::NotFound(id)),
        }
    }

    /// Reads the vote row, computes the transition and commits the row change
    /// together with the counter deltas in one transaction.
    async fn attempt_vote(&self, id: Uuid, user_id: &str, requested: VoteType) -> Result<Option<VoteType>, VoteAttemptError> {
        let current = self.get_vote(id, user_id).await?;
        let step = aggregate::transition(current, requested);

        let row = vote_row_write(&self.tables.votes, id, user_id, current, step.next)?;
        let counters = vote_counters_write(&self.tables.memes, id, &step)?;

        let result = self
            .client
            .transact_write_items()
            .transact_items(row)
            .transact_items(counters)
            .send()
            .await;

        match result {
            Ok(_) => Ok(step.next),
            Err(SdkError::ServiceError(service_err)) => match service_err.into_err() {
                TransactWriteItemsError::TransactionCanceledException(e) => {
                    let reasons = e.cancellation_reasons();
                    match classify_cancellation(reasons) {
                        VoteCancellation::MemeMissing => Err(VoteAttemptError::Fatal(RepoError::NotFound(id))),
                        VoteCancellation::Raced => {
                            tracing::debug!(meme_id = %id, %user_id, ?reasons, "DynamoDB: Vote transaction cancelled, retrying");
                            Err(VoteAttemptError::Raced)
                        }
                    }
                }
                TransactWriteItemsError::TransactionInProgressException(_) => Err(VoteAttemptError::Raced),
                other => Err(VoteAttemptError::Fatal(RepoError::BackendError(
                    anyhow::Error::new(other).context(format!("DynamoDB: Vote transaction failed (meme: {})", id)),
                ))),
            },
            Err(e) => Err(VoteAttemptError::Fatal(RepoError::BackendError(
                anyhow::Error::new(e).context(format!("DynamoDB: Vote transaction failed (meme: {})", id)),
            ))),
        }
    }

    async fn vote_totals(&self, id: Uuid) -> Result<(u64, u64), RepoError> {
        let (key, value) = meme_key(id);
        let resp = self
            .client
            .get_item()
            .table_name(&self.tables.memes)
            .key(key, value)
            .projection_expression("upvotes, downvotes")
            .consistent_read(true)
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to read vote totals (id: {})", self.tables.memes, id))
            .map_err(RepoError::BackendError)?;
        let item = resp.item.ok_or(RepoError::NotFound(id))?;
        match (db::get_counter(&item, "upvotes"), db::get_counter(&item, "downvotes")) {
            (Some(up), Some(down)) => Ok((up, down)),
            _ => Err(RepoError::DataCorruption(format!("meme {} has unreadable vote totals", id))),
        }
    }

    async fn scan_memes(&self, filter: &str, values: HashMap<String, AttributeValue>) -> Result<Vec<Meme>, RepoError> {
        tracing::debug!(table = %self.tables.memes, filter, "DynamoDB: Scanning memes");
        let mut memes = Vec::new();
        let request = self
            .client
            .scan()
            .table_name(&self.tables.memes)
            .filter_expression(filter)
            .set_expression_attribute_values(Some(values));
        for_each_page!(request.clone(), format!("DynamoDB: Failed to scan table '{}'", self.tables.memes), |item| {
            match db::item_to_meme(&item) {
                Some(meme) => memes.push(meme),
                None => {
                    let item_id = db::get_s(&item, "meme_id").map(str::to_string);
                    tracing::error!(item.id = ?item_id, table_name = %self.tables.memes, "DynamoDB: Failed to parse item from scan into Meme");
                    return Err(RepoError::DataCorruption(format!(
                        "DynamoDB: Failed to parse item {:?} during scan of table '{}'",
                        item_id, self.tables.memes
                    )));
                }
            }
        });
        tracing::debug!(table = %self.tables.memes, count = memes.len(), "DynamoDB: Scan complete");
        Ok(memes)
    }
}

#[async_trait]
impl MemeRepository for DynamoDbMemeRepository {
    async fn create(&self, meme: &Meme) -> Result<(), RepoError> {
        self.client
            .put_item()
            .table_name(&self.tables.memes)
            .set_item(Some(db::meme_to_item(meme)))
            .condition_expression("attribute_not_exists(meme_id)")
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to put meme (id: {})", self.tables.memes, meme.id))
            .map_err(RepoError::BackendError)?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Meme>, RepoError> {
        let (key, value) = meme_key(id);
        let resp = self
            .client
            .get_item()
            .table_name(&self.tables.memes)
            .key(key, value)
            .consistent_read(true)
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to get meme (id: {})", self.tables.memes, id))
            .map_err(RepoError::BackendError)?;

        match resp.item {
            Some(item) => match db::item_to_meme(&item) {
                Some(meme) => Ok(Some(meme)),
                None => {
                    tracing::error!(meme_id = %id, table_name = %self.tables.memes, "DynamoDB: Retrieved item but failed to parse into Meme");
                    Err(RepoError::DataCorruption(format!(
                        "Failed to parse meme data retrieved from DynamoDB table '{}' for id {}",
                        self.tables.memes, id
                    )))
                }
            },
            None => Ok(None),
        }
    }

    async fn list_published(&self, since: Option<DateTime<Utc>>) -> Result<Vec<Meme>, RepoError> {
        let mut values = HashMap::from([(":draft".to_string(), AttributeValue::Bool(true))]);
        let filter = match since {
            Some(since) => {
                values.insert(":since".to_string(), db::time(since));
                "is_draft <> :draft AND created_at >= :since"
            }
            None => "is_draft <> :draft",
        };
        self.scan_memes(filter, values).await
    }

    async fn list_by_creator(&self, creator_id: &str) -> Result<Vec<Meme>, RepoError> {
        let values = HashMap::from([(":creator".to_string(), s(creator_id))]);
        self.scan_memes("creator_id = :creator", values).await
    }

    async fn update_details(&self, id: Uuid, patch: &MemePatch) -> Result<Meme, RepoError> {
        let mut fields: Vec<(&str, AttributeValue)> = Vec::new();
        if let Some(v) = &patch.top_text {
            fields.push(("top_text", s(v)));
        }
        if let Some(v) = &patch.bottom_text {
            fields.push(("bottom_text", s(v)));
        }
        if let Some(v) = &patch.tags {
            fields.push(("tags", db::string_list(v)));
        }
        if let Some(v) = patch.font_size {
            fields.push(("font_size", n(v)));
        }
        if let Some(v) = &patch.font_color {
            fields.push(("font_color", s(v)));
        }
        if let Some(v) = patch.is_draft {
            fields.push(("is_draft", AttributeValue::Bool(v)));
        }
        if fields.is_empty() {
            return self.get_by_id(id).await?.ok_or(RepoError::NotFound(id));
        }

        let assignments = fields
            .iter()
            .map(|(field, _)| format!("#{field} = :{field}"))
            .collect::<Vec<_>>()
            .join(", ");
        let mut update = self
            .client
            .update_item()
            .update_expression(format!("SET {assignments}"))
            .condition_expression("attribute_exists(meme_id)")
            .return_values(ReturnValue::AllNew);
        for (field, value) in fields {
            update = update
                .expression_attribute_names(format!("#{field}"), field)
                .expression_attribute_values(format!(":{field}"), value);
        }
        match self.update_meme(id, update, "update meme details").await? {
            Ok(output) => output
                .attributes()
                .and_then(db::item_to_meme)
                .ok_or_else(|| RepoError::DataCorruption(format!("meme {} could not be decoded after update", id))),
            Err(_) => Err(RepoError::NotFound(id)),
        }
    }

    async fn get_vote(&self, id: Uuid, user_id: &str) -> Result<Option<VoteType>, RepoError> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.tables.votes)
            .set_key(Some(vote_row_key(id, user_id)))
            .consistent_read(true)
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to read vote (meme: {})", self.tables.votes, id))
            .map_err(RepoError::BackendError)?;
        match resp.item {
            Some(item) => db::item_to_vote_type(&item)
                .map(Some)
                .ok_or_else(|| RepoError::DataCorruption(format!("unreadable vote row for meme {}", id))),
            None => Ok(None),
        }
    }

    async fn list_votes(&self, id: Uuid) -> Result<Vec<Vote>, RepoError> {
        let mut votes = Vec::new();
        let (_, value) = meme_key(id);
        let request = self
            .client
            .query()
            .table_name(&self.tables.votes)
            .key_condition_expression("meme_id = :meme")
            .expression_attribute_values(":meme", value);
        for_each_page!(request.clone(), format!("DynamoDB: Failed to query votes for meme {}", id), |item| {
            let vote = db::get_s(&item, "user_id").zip(db::item_to_vote_type(&item));
            match vote {
                Some((user_id, vote_type)) => votes.push(Vote {
                    user_id: user_id.to_string(),
                    vote_type,
                }),
                None => return Err(RepoError::DataCorruption(format!("unreadable vote row for meme {}", id))),
            }
        });
        Ok(votes)
    }

    async fn cast_vote(&self, id: Uuid, user_id: &str, requested: VoteType) -> Result<VoteOutcome, RepoError> {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(20))
            .with_max_elapsed_time(Some(Duration::from_secs(2)))
            .build();

        let effective_vote = retry(policy, || async move {
            self.attempt_vote(id, user_id, requested).await.map_err(|e| match e {
                VoteAttemptError::Raced => backoff::Error::transient(RepoError::Contention(format!(
                    "vote by {} on meme {}",
                    user_id, id
                ))),
                VoteAttemptError::Fatal(e) => backoff::Error::permanent(e),
            })
        })
        .await?;

        let (upvotes, downvotes) = self.vote_totals(id).await?;
        tracing::debug!(meme_id = %id, %user_id, ?effective_vote, upvotes, downvotes, "DynamoDB: Vote committed");
        Ok(VoteOutcome {
            upvotes,
            downvotes,
            effective_vote,
        })
    }

    async fn add_flag(&self, id: Uuid, flag: &Flag, policy: FlagPolicy) -> Result<FlagOutcome, RepoError> {
        // With a threshold of one every flag raises the banner; otherwise start
        // by assuming this flag stays below it and let the guard correct us.
        let mut raise = policy.threshold <= 1;
        for attempt in 0..MAX_FLAG_ATTEMPTS {
            let expressions = flag_update(flag, policy, raise);
            let update = self
                .client
                .update_item()
                .update_expression(expressions.update)
                .condition_expression(expressions.condition)
                .set_expression_attribute_values(Some(expressions.values))
                .return_values(ReturnValue::AllNew);

            match self.update_meme(id, update, "add flag").await? {
                Ok(output) => {
                    let flag_count = self.counter_from(id, &output, "flag_count")?;
                    let stored_flag = output
                        .attributes()
                        .and_then(|attrs| attrs.get("is_flagged"))
                        .and_then(|v| v.as_bool().ok().copied())
                        .unwrap_or(false);
                    if raise && flag_count == policy.threshold.max(1) {
                        info!(meme_id = %id, flag_count, "DynamoDB: Meme crossed flag threshold");
                    }
                    return Ok(FlagOutcome {
                        flag_count,
                        is_flagged: policy.is_flagged(flag_count, stored_flag),
                    });
                }
                Err(old) => match flag_rejection(flag, policy, old.as_ref()) {
                    FlagRetry::NotFound => return Err(RepoError::NotFound(id)),
                    FlagRetry::AlreadyFlagged => {
                        return Err(RepoError::AlreadyFlagged {
                            meme_id: id,
                            user_id: flag.user_id.clone(),
                        })
                    }
                    FlagRetry::Again { raise: next } => {
                        tracing::debug!(meme_id = %id, attempt, raise = next, "DynamoDB: Flag count moved, re-sending flag");
                        raise = next;
                    }
                },
            }
        }
        Err(RepoError::Contention(format!("flag by {} on meme {}", flag.user_id, id)))
    }

    async fn increment_comment_count(&self, id: Uuid) -> Result<u64, RepoError> {
        self.increment(id, "comment_count").await
    }

    async fn decrement_comment_count(&self, id: Uuid) -> Result<u64, RepoError> {
        let update = self
            .client
            .update_item()
            .update_expression("SET comment_count = comment_count - :one")
            .condition_expression("attribute_exists(meme_id) AND comment_count > :zero")
            .expression_attribute_values(":one", n(1))
            .expression_attribute_values(":zero", n(0))
            .return_values(ReturnValue::UpdatedNew);
        match self.update_meme(id, update, "decrement comment_count").await? {
            Ok(output) => self.counter_from(id, &output, "comment_count"),
            Err(old) => clamped_comment_count(id, old.as_ref()),
        }
    }

    async fn increment_views(&self, id: Uuid) -> Result<u64, RepoError> {
        self.increment(id, "views").await
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        tracing::debug!(meme_id = %id, table_name = %self.tables.memes, "DynamoDB: Deleting meme and its votes");

        let votes = self.list_votes(id).await?;
        let keys = votes
            .iter()
            .map(|vote| vote_row_key(id, &vote.user_id))
            .collect();
        batch_delete(&self.client, &self.tables.votes, keys).await?;

        let (key, value) = meme_key(id);
        self.client
            .delete_item()
            .table_name(&self.tables.memes)
            .key(key, value)
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to delete meme (id: {})", self.tables.memes, id))
            .map_err(RepoError::BackendError)?;

        tracing::debug!(meme_id = %id, votes_removed = votes.len(), "DynamoDB: Meme deleted");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct DynamoDbCommentRepository {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoDbCommentRepository {
    pub fn new(client: DynamoDbClient, table_name: String) -> Self {
        info!(%table_name, "Initializing DynamoDbCommentRepository");
        Self { client, table_name }
    }

    fn comment_key(id: Uuid) -> (String, AttributeValue) {
        ("comment_id".to_string(), s(id.to_string()))
    }
}

#[async_trait]
impl CommentRepository for DynamoDbCommentRepository {
    async fn create(&self, comment: &Comment) -> Result<(), RepoError> {
        self.client
            .put_item()
            .table_name(&self.table_name)
            .set_item(Some(db::comment_to_item(comment)))
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to put comment (id: {})", self.table_name, comment.id))
            .map_err(RepoError::BackendError)?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Option<Comment>, RepoError> {
        let (key, value) = Self::comment_key(id);
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key(key, value)
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to get comment (id: {})", self.table_name, id))
            .map_err(RepoError::BackendError)?;
        match resp.item {
            Some(item) => db::item_to_comment(&item)
                .map(Some)
                .ok_or_else(|| RepoError::DataCorruption(format!("unreadable comment {}", id))),
            None => Ok(None),
        }
    }

    async fn list_for_meme(&self, meme_id: Uuid) -> Result<Vec<Comment>, RepoError> {
        let mut comments = Vec::new();
        let request = self
            .client
            .query()
            .table_name(&self.table_name)
            .index_name(COMMENTS_BY_MEME_INDEX)
            .key_condition_expression("meme_id = :meme")
            .expression_attribute_values(":meme", s(meme_id.to_string()))
            .scan_index_forward(false);
        for_each_page!(request.clone(), format!("DynamoDB: Failed to query comments for meme {}", meme_id), |item| {
            match db::item_to_comment(&item) {
                Some(comment) => comments.push(comment),
                None => {
                    return Err(RepoError::DataCorruption(format!(
                        "unreadable comment in index '{}' for meme {}",
                        COMMENTS_BY_MEME_INDEX, meme_id
                    )))
                }
            }
        });
        Ok(comments)
    }

    async fn delete(&self, id: Uuid) -> Result<bool, RepoError> {
        let (key, value) = Self::comment_key(id);
        let resp = self
            .client
            .delete_item()
            .table_name(&self.table_name)
            .key(key, value)
            .return_values(ReturnValue::AllOld)
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to delete comment (id: {})", self.table_name, id))
            .map_err(RepoError::BackendError)?;
        // Only the request that actually removed the row sees the old attributes.
        Ok(resp.attributes.is_some_and(|attrs| !attrs.is_empty()))
    }

    async fn delete_for_meme(&self, meme_id: Uuid) -> Result<usize, RepoError> {
        let mut keys = Vec::new();
        let request = self
            .client
            .query()
            .table_name(&self.table_name)
            .index_name(COMMENTS_BY_MEME_INDEX)
            .key_condition_expression("meme_id = :meme")
            .expression_attribute_values(":meme", s(meme_id.to_string()))
            .projection_expression("comment_id");
        for_each_page!(request.clone(), format!("DynamoDB: Failed to query comments for meme {}", meme_id), |item| {
            if let Some(id) = item.get("comment_id") {
                keys.push(HashMap::from([("comment_id".to_string(), id.clone())]));
            }
        });
        let removed = keys.len();
        batch_delete(&self.client, &self.table_name, keys).await?;
        tracing::debug!(%meme_id, removed, "DynamoDB: Removed comments of meme");
        Ok(removed)
    }
}

/// Looks bearer tokens up in the sessions table.
#[derive(Debug, Clone)]
pub struct DynamoDbSessionResolver {
    client: DynamoDbClient,
    table_name: String,
}

impl DynamoDbSessionResolver {
    pub fn new(client: DynamoDbClient, table_name: String) -> Self {
        Self { client, table_name }
    }
}

#[async_trait]
impl IdentityResolver for DynamoDbSessionResolver {
    async fn resolve(&self, token: &str) -> Result<Option<Identity>, RepoError> {
        let resp = self
            .client
            .get_item()
            .table_name(&self.table_name)
            .key("token", s(token))
            .send()
            .await
            .context(format!("DynamoDB (table: {}): Failed to look up session", self.table_name))
            .map_err(RepoError::BackendError)?;
        Ok(resp.item.and_then(|item| db::item_to_identity(&item, Utc::now())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::VoteType::{Down, Up};
    use std::collections::BTreeSet;

    fn placeholders(expression: &str) -> BTreeSet<String> {
        let mut found = BTreeSet::new();
        let mut rest = expression;
        while let Some(start) = rest.find(':') {
            let tail = &rest[start + 1..];
            let len = tail
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(tail.len());
            found.insert(format!(":{}", &tail[..len]));
            rest = &tail[len..];
        }
        found
    }

    fn reason(code: &str) -> CancellationReason {
        CancellationReason::builder().code(code).build()
    }

    fn flag(user_id: &str) -> Flag {
        Flag {
            user_id: user_id.to_string(),
            reason: "spam".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn vote_row_writes_are_guarded_on_the_row_we_read() {
        let id = Uuid::new_v4();

        let first = vote_row_write("votes", id, "u1", None, Some(Up)).unwrap();
        let put = first.put().expect("first vote inserts a row");
        assert_eq!(put.condition_expression(), Some("attribute_not_exists(user_id)"));
        assert!(first.update().is_none() && first.delete().is_none());

        let switch = vote_row_write("votes", id, "u1", Some(Up), Some(Down)).unwrap();
        let update = switch.update().expect("switching updates the row");
        assert_eq!(update.condition_expression(), Some("vote_type = :current"));
        let values = update.expression_attribute_values().unwrap();
        assert_eq!(values[":current"], s("up"));
        assert_eq!(values[":next"], s("down"));

        let toggle = vote_row_write("votes", id, "u1", Some(Down), None).unwrap();
        let delete = toggle.delete().expect("toggling off removes the row");
        assert_eq!(delete.condition_expression(), Some("vote_type = :current"));
        assert_eq!(delete.expression_attribute_values().unwrap()[":current"], s("down"));

        assert!(matches!(
            vote_row_write("votes", id, "u1", None, None),
            Err(RepoError::DataCorruption(_))
        ));
    }

    #[test]
    fn vote_counters_carry_both_deltas_and_require_the_meme() {
        let step = aggregate::transition(Some(Up), Down);
        let write = vote_counters_write("memes", Uuid::new_v4(), &step).unwrap();
        let update = write.update().unwrap();
        assert_eq!(update.condition_expression(), Some("attribute_exists(meme_id)"));
        let values = update.expression_attribute_values().unwrap();
        assert_eq!(values[":up"], n(-1));
        assert_eq!(values[":down"], n(1));
    }

    #[test]
    fn only_a_failed_counter_guard_means_the_meme_is_gone() {
        assert_eq!(
            classify_cancellation(&[reason("None"), reason("ConditionalCheckFailed")]),
            VoteCancellation::MemeMissing
        );
        assert_eq!(
            classify_cancellation(&[reason("ConditionalCheckFailed"), reason("None")]),
            VoteCancellation::Raced
        );
        assert_eq!(
            classify_cancellation(&[reason("None"), reason("TransactionConflict")]),
            VoteCancellation::Raced
        );
        assert_eq!(classify_cancellation(&[]), VoteCancellation::Raced);
    }

    #[test]
    fn comment_count_guard_failure_clamps_or_reports_missing() {
        let id = Uuid::new_v4();
        let at_zero = HashMap::from([meme_key(id), ("comment_count".to_string(), n(0))]);
        assert_eq!(clamped_comment_count(id, Some(&at_zero)).unwrap(), 0);

        let never_counted = HashMap::from([meme_key(id)]);
        assert_eq!(clamped_comment_count(id, Some(&never_counted)).unwrap(), 0);

        assert!(matches!(clamped_comment_count(id, None), Err(RepoError::NotFound(got)) if got == id));
    }

    #[test]
    fn flag_updates_bind_exactly_the_values_they_use() {
        for threshold in [1, 3] {
            for once_per_user in [false, true] {
                for raise in [false, true] {
                    let policy = FlagPolicy {
                        threshold,
                        once_per_user,
                    };
                    let expr = flag_update(&flag("u1"), policy, raise);
                    let mut used = placeholders(&expr.update);
                    used.extend(placeholders(&expr.condition));
                    let bound: BTreeSet<String> = expr.values.keys().cloned().collect();
                    assert_eq!(used, bound, "threshold {threshold}, once {once_per_user}, raise {raise}");
                    assert_eq!(
                        expr.condition.contains("NOT contains(flagged_by, :user)"),
                        once_per_user
                    );
                }
            }
        }
    }

    #[test]
    fn flag_update_raises_the_banner_in_the_same_write() {
        let policy = FlagPolicy {
            threshold: 3,
            once_per_user: false,
        };

        let below = flag_update(&flag("u1"), policy, false);
        assert!(!below.update.contains("is_flagged"));
        assert!(below.condition.contains("flag_count < :floor"));
        assert_eq!(below.values[":floor"], n(2));

        let crossing = flag_update(&flag("u1"), policy, true);
        assert!(crossing.update.contains("is_flagged = :yes"));
        assert!(crossing.condition.contains("flag_count >= :floor"));
        assert_eq!(crossing.values[":yes"], AttributeValue::Bool(true));

        let first_flag_counts = flag_update(&flag("u1"), FlagPolicy::default(), true);
        assert!(first_flag_counts.update.contains("is_flagged = :yes"));
        assert!(!first_flag_counts.condition.contains("flag_count"));
    }

    #[test]
    fn failed_flag_guard_is_classified_from_the_old_item() {
        let id = Uuid::new_v4();
        let policy = FlagPolicy {
            threshold: 3,
            once_per_user: true,
        };
        assert_eq!(flag_rejection(&flag("u1"), policy, None), FlagRetry::NotFound);

        let mut old = HashMap::from([
            meme_key(id),
            ("flag_count".to_string(), n(2)),
            ("flagged_by".to_string(), AttributeValue::Ss(vec!["u1".to_string()])),
        ]);
        assert_eq!(flag_rejection(&flag("u1"), policy, Some(&old)), FlagRetry::AlreadyFlagged);
        assert_eq!(
            flag_rejection(&flag("u2"), policy, Some(&old)),
            FlagRetry::Again { raise: true }
        );

        let repeats_allowed = FlagPolicy {
            once_per_user: false,
            ..policy
        };
        assert_eq!(
            flag_rejection(&flag("u1"), repeats_allowed, Some(&old)),
            FlagRetry::Again { raise: true }
        );

        old.insert("flag_count".to_string(), n(0));
        assert_eq!(
            flag_rejection(&flag("u2"), policy, Some(&old)),
            FlagRetry::Again { raise: false }
        );
    }
}
