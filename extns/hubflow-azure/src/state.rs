use std::collections::HashMap;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::Utc;
use futures::future::join_all;
use hmac::{Hmac, Mac};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{AzureTableConfig, Error, Result};

const API_VERSION: &str = "2019-02-02";

/// Table service names allow 63 characters; a truncated digest plus the
/// three-character prefix stays well inside that.
const NAME_DIGEST_LEN: usize = 40;

/// One partition's persisted row: `id` names the partition, `state` is an
/// opaque serialized blob owned by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct StateEntity {
    pub id: String,
    pub state: String,
}

#[derive(Serialize)]
struct UpsertBody<'a> {
    #[serde(rename = "State")]
    state: &'a str,
}

#[derive(Deserialize)]
struct EntityRow {
    #[serde(rename = "State")]
    state: Option<String>,
}

#[derive(Serialize)]
struct CreateTableBody<'a> {
    #[serde(rename = "TableName")]
    table_name: &'a str,
}

/// Client for the state table of one storage account. Requests are signed
/// with the SharedKeyLite scheme; upserts are per-entity insert-or-replace
/// calls (best effort across a batch, not atomic), lookups run in parallel
/// and map 404 to "no prior state".
#[derive(Clone, Debug)]
pub struct StateTableClient {
    http: Client,
    account: String,
    key: Vec<u8>,
    endpoint: String,
}

impl StateTableClient {
    pub fn new(config: AzureTableConfig) -> Result<Self> {
        let key = BASE64
            .decode(config.access_key.as_bytes())
            .map_err(|e| Error::Auth(format!("access key is not valid base64: {e}")))?;
        let endpoint = format!("https://{}.table.core.windows.net", config.account);
        Ok(StateTableClient {
            http: Client::new(),
            account: config.account,
            key,
            endpoint,
        })
    }

    /// Upserts one row per entity. Rows already written stay written when a
    /// later entity fails. The backing table is created lazily on the first
    /// write against a fresh account.
    pub async fn store_state(
        &self,
        hub_namespace: &str,
        hub_name: &str,
        consumer_group: &str,
        entities: Vec<StateEntity>,
    ) -> Result<()> {
        let table = table_name(hub_namespace, hub_name);
        let pk = partition_key(consumer_group);
        let mut table_checked = false;
        for entity in &entities {
            let rk = row_key(&entity.id);
            match self.upsert(&table, &pk, &rk, &entity.state).await {
                Ok(()) => {}
                Err(Error::Response { status: 404, .. }) if !table_checked => {
                    self.create_table(&table).await?;
                    table_checked = true;
                    self.upsert(&table, &pk, &rk, &entity.state).await?;
                }
                Err(err) => return Err(err),
            }
        }
        debug!(table = %table, entities = entities.len(), "Stored hub state");
        Ok(())
    }

    /// Point-lookups of all requested partitions, in parallel. Partitions
    /// without a row map to `None`.
    pub async fn retrieve_state(
        &self,
        hub_namespace: &str,
        hub_name: &str,
        consumer_group: &str,
        partition_ids: &[String],
    ) -> Result<HashMap<String, Option<String>>> {
        let table = table_name(hub_namespace, hub_name);
        let pk = partition_key(consumer_group);
        let lookups = partition_ids.iter().map(|id| {
            let table = table.clone();
            let pk = pk.clone();
            let id = id.clone();
            async move {
                let result = self.lookup(&table, &pk, &row_key(&id)).await;
                (id, result)
            }
        });
        let mut out = HashMap::with_capacity(partition_ids.len());
        for (id, result) in join_all(lookups).await {
            out.insert(id, result?);
        }
        Ok(out)
    }

    async fn upsert(&self, table: &str, pk: &str, rk: &str, state: &str) -> Result<()> {
        let resource = entity_resource(table, pk, rk);
        let date = http_date();
        let body =
            serde_json::to_vec(&UpsertBody { state }).map_err(|e| Error::Encoding(e.to_string()))?;
        let response = self
            .http
            .put(format!("{}/{resource}", self.endpoint))
            .header("Authorization", self.authorization(&date, &resource)?)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header("Accept", "application/json;odata=nometadata")
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;
        Self::expect_success(response).await?;
        Ok(())
    }

    async fn lookup(&self, table: &str, pk: &str, rk: &str) -> Result<Option<String>> {
        let resource = entity_resource(table, pk, rk);
        let date = http_date();
        let response = self
            .http
            .get(format!("{}/{resource}", self.endpoint))
            .header("Authorization", self.authorization(&date, &resource)?)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header("Accept", "application/json;odata=nometadata")
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = Self::expect_success(response).await?;
        let row: EntityRow = response
            .json()
            .await
            .map_err(|e| Error::Encoding(format!("decoding entity row: {e}")))?;
        Ok(row.state)
    }

    async fn create_table(&self, table: &str) -> Result<()> {
        let resource = "Tables";
        let date = http_date();
        let body = serde_json::to_vec(&CreateTableBody { table_name: table })
            .map_err(|e| Error::Encoding(e.to_string()))?;
        let response = self
            .http
            .post(format!("{}/{resource}", self.endpoint))
            .header("Authorization", self.authorization(&date, resource)?)
            .header("x-ms-date", &date)
            .header("x-ms-version", API_VERSION)
            .header("Accept", "application/json;odata=nometadata")
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| Error::Request(e.to_string()))?;
        // Losing the creation race to another writer is fine.
        if response.status() == StatusCode::CONFLICT {
            return Ok(());
        }
        Self::expect_success(response).await?;
        debug!(table = %table, "Created state table");
        Ok(())
    }

    async fn expect_success(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(Error::Response {
            status: status.as_u16(),
            message,
        })
    }

    /// SharedKeyLite authorization for the table service: sign
    /// `date \n /account/resource` with the account key.
    fn authorization(&self, date: &str, resource: &str) -> Result<String> {
        let to_sign = format!("{date}\n/{}/{resource}", self.account);
        let mut mac = Hmac::<Sha256>::new_from_slice(&self.key)
            .map_err(|e| Error::Auth(format!("invalid account key: {e}")))?;
        mac.update(to_sign.as_bytes());
        let signature = BASE64.encode(mac.finalize().into_bytes());
        Ok(format!("SharedKeyLite {}:{signature}", self.account))
    }
}

fn http_date() -> String {
    Utc::now().format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

fn short_digest(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        hex.push_str(&format!("{byte:02x}"));
    }
    hex.truncate(NAME_DIGEST_LEN);
    hex
}

fn table_name(hub_namespace: &str, hub_name: &str) -> String {
    format!("tbl{}", short_digest(&format!("{hub_namespace}:{hub_name}")))
}

fn partition_key(consumer_group: &str) -> String {
    format!("pk{}", short_digest(consumer_group))
}

fn row_key(partition_id: &str) -> String {
    format!("rk{}", short_digest(&format!("partition:{partition_id}")))
}

fn entity_resource(table: &str, pk: &str, rk: &str) -> String {
    format!("{table}(PartitionKey='{pk}',RowKey='{rk}')")
}
