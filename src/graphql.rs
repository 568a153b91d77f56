use std::fmt::Display;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use serde::{de::DeserializeOwned, Deserialize};

use crate::{
    normalizer::RawTransaction, BlockHeader, BlockHeight, BlockSource, RawBlock,
    TransactionSource,
};

pub const GNOYAGER_ENDPOINT: &str = "https://gnoyager1.v8r.io/graphql/query";

/// Client for the tx-indexer GraphQL API. Provides both blocks and transactions.
#[derive(Clone)]
pub struct GraphqlProvider {
    endpoint: String,
    client: reqwest::Client,
}

impl GraphqlProvider {
    pub fn with_endpoint(endpoint: String) -> Self {
        Self::with_endpoint_and_client(endpoint, crate::http_client())
    }

    pub fn with_endpoint_and_client(endpoint: String, client: reqwest::Client) -> Self {
        Self { endpoint, client }
    }

    pub fn gnoyager() -> Self {
        Self::with_endpoint(GNOYAGER_ENDPOINT.to_string())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Sends a query and returns its `data` object.
    pub async fn query<T: DeserializeOwned>(&self, query: &str) -> Result<T, GraphqlError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/json")
            .body(serde_json::json!({ "query": query }).to_string())
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(GraphqlError::Status {
                status: status.as_u16(),
                response: text,
            });
        }
        let response = match serde_json::from_str::<GraphqlResponse<T>>(&text) {
            Ok(response) => response,
            Err(err) => {
                return Err(GraphqlError::FailedToParse {
                    err,
                    response: text,
                })
            }
        };
        match response.data {
            Some(data) => {
                for error in response.errors {
                    log::warn!(target: "gnopoller::graphql", "Query returned data with an error: {}", error.message);
                }
                Ok(data)
            }
            None if !response.errors.is_empty() => Err(GraphqlError::Server(
                response
                    .errors
                    .into_iter()
                    .map(|error| error.message)
                    .collect(),
            )),
            None => Err(GraphqlError::MissingField("data")),
        }
    }
}

pub fn blocks_query(since: DateTime<Utc>) -> String {
    format!(
        r#"query {{
  blocks(filter: {{ from_time: "{}" }}) {{
    height
    version
    chain_id
    time
    proposer_address_raw
  }}
}}"#,
        since.format("%Y-%m-%dT%H:%M:%SZ")
    )
}

pub fn transactions_query(from_height: BlockHeight) -> String {
    format!(
        r#"query {{
  transactions(filter: {{ from_block_height: {from_height} }}) {{
    block_height
    hash
    messages {{
      route
      typeUrl
      value {{
        __typename
        ... on BankMsgSend {{
          from_address
          to_address
          amount
        }}
        ... on MsgAddPackage {{
          creator
          package {{
            name
            path
          }}
        }}
        ... on MsgCall {{
          caller
          pkg_path
          args
        }}
        ... on MsgRun {{
          caller
          package {{
            path
          }}
        }}
      }}
    }}
  }}
}}"#
    )
}

#[derive(Deserialize, Debug)]
struct GraphqlResponse<T> {
    data: Option<T>,
    #[serde(default)]
    errors: Vec<GraphqlErrorMessage>,
}

#[derive(Deserialize, Debug)]
struct GraphqlErrorMessage {
    message: String,
}

#[derive(Deserialize, Debug)]
struct BlocksData {
    blocks: Option<Vec<RawBlock>>,
}

#[derive(Deserialize, Debug)]
struct TransactionsData {
    transactions: Option<Vec<RawTransaction>>,
}

#[async_trait]
impl BlockSource for GraphqlProvider {
    type Error = GraphqlError;

    async fn recent_blocks(&self, since: DateTime<Utc>) -> Result<Vec<BlockHeader>, Self::Error> {
        let data: BlocksData = self.query(&blocks_query(since)).await?;
        let blocks = data.blocks.ok_or(GraphqlError::MissingField("blocks"))?;
        Ok(blocks.into_iter().map(BlockHeader::from).collect())
    }
}

#[async_trait]
impl TransactionSource for GraphqlProvider {
    type Error = GraphqlError;

    async fn transactions_from(
        &self,
        from_height: BlockHeight,
    ) -> Result<Vec<RawTransaction>, Self::Error> {
        let data: TransactionsData = self.query(&transactions_query(from_height)).await?;
        data.transactions
            .ok_or(GraphqlError::MissingField("transactions"))
    }
}

#[derive(Debug)]
pub enum GraphqlError {
    FailedToParse {
        err: serde_json::Error,
        response: String,
    },
    Status {
        status: u16,
        response: String,
    },
    /// The server answered with `errors` and no `data`.
    Server(Vec<String>),
    MissingField(&'static str),
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl<E> From<E> for GraphqlError
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        GraphqlError::Other(Box::new(err))
    }
}

impl Display for GraphqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GraphqlError::FailedToParse { err, response } => {
                write!(f, "Failed to parse response: {err:?}\nResponse: {response}")
            }
            GraphqlError::Status { status, response } => {
                write!(f, "Server responded with status {status}: {response}")
            }
            GraphqlError::Server(errors) => write!(f, "Query failed: {}", errors.join("; ")),
            GraphqlError::MissingField(field) => {
                write!(f, "Response is missing the '{field}' field")
            }
            GraphqlError::Other(err) => write!(f, "{err}"),
        }
    }
}
