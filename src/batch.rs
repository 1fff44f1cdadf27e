use std::{
    collections::{BTreeSet, HashMap},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    dispatcher::MessageDispatcher,
    error::DispatchError,
    models::{
        batch::{MessageBatch, RowError},
        message::{Channel, DispatchRequest},
        template::Template,
    },
    store::BatchRepository,
    templates::template_placeholders,
};

pub const PHONE_HEADER: &str = "phone";
pub const EMAIL_HEADER: &str = "email";
pub const LANGUAGE_HEADER: &str = "language";
pub const TREATMENT_HEADER: &str = "treatment";

/// How long a `processing` batch may go without progress before another
/// worker takes it over.
pub const DEFAULT_BATCH_LEASE: Duration = Duration::from_secs(600);

/// Header row plus one header→value mapping per data row, in file order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Table {
    pub headers: Vec<String>,
    pub rows: Vec<HashMap<String, String>>,
}

pub trait TabularReader: Send + Sync {
    /// Reads only the header row; data rows are left unparsed.
    fn headers(&self, bytes: &[u8]) -> Result<Vec<String>, DispatchError>;

    fn read(&self, bytes: &[u8]) -> Result<Table, DispatchError>;
}

pub struct CsvReader {
    delimiter: u8,
}

impl CsvReader {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }

    fn reader<'a>(&self, bytes: &'a [u8]) -> csv::Reader<&'a [u8]> {
        csv::ReaderBuilder::new()
            .delimiter(self.delimiter)
            .trim(csv::Trim::All)
            .from_reader(bytes)
    }
}

fn header_row(reader: &mut csv::Reader<&[u8]>) -> Result<Vec<String>, DispatchError> {
    Ok(reader
        .headers()
        .map_err(|e| DispatchError::MalformedFile(e.to_string()))?
        .iter()
        .map(str::to_string)
        .collect())
}

impl Default for CsvReader {
    fn default() -> Self {
        Self::new(b',')
    }
}

impl TabularReader for CsvReader {
    fn headers(&self, bytes: &[u8]) -> Result<Vec<String>, DispatchError> {
        header_row(&mut self.reader(bytes))
    }

    fn read(&self, bytes: &[u8]) -> Result<Table, DispatchError> {
        let mut reader = self.reader(bytes);
        let headers = header_row(&mut reader)?;

        let rows = reader
            .records()
            .map(|record| {
                let record = record.map_err(|e| DispatchError::MalformedFile(e.to_string()))?;
                Ok(headers
                    .iter()
                    .cloned()
                    .zip(record.iter().map(str::to_string))
                    .collect())
            })
            .collect::<Result<Vec<_>, DispatchError>>()?;

        Ok(Table { headers, rows })
    }
}

/// Rejects a header row that cannot address anyone or cannot fill the
/// template's placeholders.
pub fn check_headers(template: &Template, headers: &[String]) -> Result<(), DispatchError> {
    let present: BTreeSet<&str> = headers.iter().map(String::as_str).collect();

    let mut channels = Vec::with_capacity(2);
    if present.contains(PHONE_HEADER) {
        channels.push(Channel::Sms);
    }
    if present.contains(EMAIL_HEADER) {
        channels.push(Channel::Email);
    }

    if channels.is_empty() {
        return Err(DispatchError::MissingHeaders {
            detail: "Recipient file needs a phone or email column".to_string(),
            missing: BTreeSet::from([PHONE_HEADER.to_string(), EMAIL_HEADER.to_string()]),
        });
    }

    let missing: BTreeSet<String> = template_placeholders(template, &channels)
        .into_iter()
        .filter(|name| !present.contains(name.as_str()))
        .collect();

    if !missing.is_empty() {
        return Err(DispatchError::MissingHeaders {
            detail: format!(
                "Recipient file lacks placeholder columns used by template '{}'",
                template.name
            ),
            missing,
        });
    }

    Ok(())
}

/// Turns one row into a dispatch request. Reserved columns become the
/// recipient and variant selectors; every other column is a parameter.
pub fn row_request(
    template_name: &str,
    batch_id: Uuid,
    row_number: usize,
    row: &HashMap<String, String>,
) -> DispatchRequest {
    let cell = |name: &str| row.get(name).filter(|v| !v.is_empty()).cloned();

    let params = row
        .iter()
        .filter(|(key, _)| {
            ![PHONE_HEADER, EMAIL_HEADER, LANGUAGE_HEADER, TREATMENT_HEADER].contains(&key.as_str())
        })
        .map(|(key, value)| (key.clone(), JsonValue::String(value.clone())))
        .collect();

    DispatchRequest {
        template_name: template_name.to_string(),
        phone: cell(PHONE_HEADER),
        email: cell(EMAIL_HEADER),
        language: cell(LANGUAGE_HEADER),
        treatment: cell(TREATMENT_HEADER),
        params,
        batch_id: Some(batch_id),
        batch_row: Some(row_number),
    }
}

pub struct BatchIngestor {
    dispatcher: Arc<MessageDispatcher>,
    batches: Arc<dyn BatchRepository>,
    reader: Arc<dyn TabularReader>,
    lease: Duration,
}

impl BatchIngestor {
    pub fn new(
        dispatcher: Arc<MessageDispatcher>,
        batches: Arc<dyn BatchRepository>,
        reader: Arc<dyn TabularReader>,
    ) -> Self {
        Self {
            dispatcher,
            batches,
            reader,
            lease: DEFAULT_BATCH_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    fn stale_before(&self) -> DateTime<Utc> {
        chrono::Duration::from_std(self.lease)
            .ok()
            .and_then(|lease| Utc::now().checked_sub_signed(lease))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Validates and stores a recipient file. A batch without a future
    /// `send_at` is expanded and dispatched before returning; otherwise it
    /// waits for the scheduler.
    pub async fn ingest(
        &self,
        file: &[u8],
        template_name: &str,
        send_at: Option<DateTime<Utc>>,
    ) -> Result<MessageBatch, DispatchError> {
        let template = self.dispatcher.templates().get(template_name).await?;

        let text = std::str::from_utf8(file)
            .map_err(|e| DispatchError::MalformedFile(format!("file is not UTF-8: {}", e)))?;
        check_headers(&template, &self.reader.headers(file)?)?;
        let table = self.reader.read(file)?;

        let batch = MessageBatch::new(template.name, text.to_string(), send_at);
        self.batches.insert_batch(&batch).await?;

        info!(
            batch_id = %batch.id,
            template = %batch.template_name,
            rows = table.rows.len(),
            send_at = ?batch.send_at,
            "Batch stored"
        );

        if !batch.is_due(Utc::now()) {
            return Ok(batch);
        }

        match self.expand_batch(batch.id).await? {
            Some(expanded) => Ok(expanded),
            None => self.get(batch.id).await,
        }
    }

    /// Expands a scheduled batch into messages, one row at a time. Returns
    /// `None` when another worker holds a live claim on the batch or it has
    /// already completed.
    ///
    /// A failed expansion hands the batch back to `scheduled`; if that hand
    /// back fails too, the batch is picked up again once its lease expires.
    /// Either way the retry skips rows that already produced a message.
    pub async fn expand_batch(&self, batch_id: Uuid) -> Result<Option<MessageBatch>, DispatchError> {
        let Some(batch) = self.batches.claim_batch(batch_id, self.stale_before()).await? else {
            if self.batches.get_batch(batch_id).await?.is_none() {
                return Err(DispatchError::BatchNotFound(batch_id));
            }
            debug!(%batch_id, "Batch already claimed, skipping expansion");
            return Ok(None);
        };

        match self.expand_rows(&batch).await {
            Ok(expanded) => Ok(Some(expanded)),
            Err(e) => {
                warn!(%batch_id, error = %e, "Batch expansion failed, releasing claim");
                if let Err(release_error) = self.batches.release_batch(batch_id).await {
                    error!(
                        %batch_id,
                        error = %release_error,
                        "Batch claim not released, waiting for lease expiry"
                    );
                }
                Err(e)
            }
        }
    }

    async fn expand_rows(&self, batch: &MessageBatch) -> Result<MessageBatch, DispatchError> {
        let batch_id = batch.id;
        let expanded: HashMap<usize, Uuid> = self
            .dispatcher
            .messages()
            .batch_row_messages(batch_id)
            .await?
            .into_iter()
            .collect();

        if !expanded.is_empty() {
            info!(%batch_id, rows = expanded.len(), "Resuming batch expansion");
        }

        let mut message_ids = Vec::new();
        let mut row_errors = Vec::new();

        match self.reader.read(batch.recipients.as_bytes()) {
            Ok(table) => {
                for (index, row) in table.rows.iter().enumerate() {
                    let row_number = index + 1;
                    if let Some(message_id) = expanded.get(&row_number) {
                        message_ids.push(*message_id);
                        continue;
                    }

                    let request = row_request(&batch.template_name, batch_id, row_number, row);
                    match self.dispatcher.dispatch(request).await {
                        Ok(message) => message_ids.push(message.id),
                        Err(DispatchError::Storage(e)) => return Err(DispatchError::Storage(e)),
                        Err(e) => {
                            warn!(%batch_id, row = row_number, error = %e, "Batch row failed");
                            row_errors.push(RowError {
                                row: row_number,
                                error: e.to_string(),
                            });
                        }
                    }

                    self.batches.renew_batch(batch_id).await?;
                }
            }
            Err(e) => {
                warn!(%batch_id, error = %e, "Stored recipient file could not be read");
                row_errors.push(RowError {
                    row: 0,
                    error: e.to_string(),
                });
            }
        }

        self.batches
            .complete_batch(batch_id, &message_ids, &row_errors)
            .await?;

        info!(
            %batch_id,
            dispatched = message_ids.len(),
            failed = row_errors.len(),
            "Batch expanded"
        );

        self.get(batch_id).await
    }

    pub async fn get(&self, batch_id: Uuid) -> Result<MessageBatch, DispatchError> {
        self.batches
            .get_batch(batch_id)
            .await?
            .ok_or(DispatchError::BatchNotFound(batch_id))
    }

    /// Drops a batch that has not started expanding yet.
    pub async fn cancel(&self, batch_id: Uuid) -> Result<(), DispatchError> {
        if self.batches.delete_scheduled_batch(batch_id).await? {
            info!(%batch_id, "Scheduled batch cancelled");
            return Ok(());
        }

        match self.batches.get_batch(batch_id).await? {
            None => Err(DispatchError::BatchNotFound(batch_id)),
            Some(_) => Err(DispatchError::BatchNotCancellable(batch_id)),
        }
    }

    /// Batches ready for expansion, including ones whose worker lost its lease.
    pub async fn due_batches(&self) -> Result<Vec<Uuid>, DispatchError> {
        Ok(self.batches.due_batches(Utc::now(), self.stale_before()).await?)
    }
}
