use crate::error::ProviderError;
use crate::mailbox::MailProvider;
use async_trait::async_trait;
use google_gmail1::Gmail;
use google_gmail1::api::Message;
use hyper::client::HttpConnector;
use hyper_rustls::HttpsConnector;
use tracing::debug;

type Connector = HttpsConnector<HttpConnector>;

/// Gmail REST provider. A fresh hub is built for every call from the access
/// token it is given, so one instance serves any number of users.
#[derive(Clone)]
pub struct GmailProvider {
    client: hyper::Client<Connector>,
}

impl GmailProvider {
    pub fn new() -> Result<Self, ProviderError> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| ProviderError::Connector(e.to_string()))?
            .https_only()
            .enable_http1()
            .build();

        Ok(Self {
            client: hyper::Client::builder().build(connector),
        })
    }

    fn hub(&self, access_token: &str) -> Gmail<Connector> {
        Gmail::new(self.client.clone(), access_token.to_string())
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    async fn list_message_ids(
        &self,
        access_token: &str,
        query: &str,
        max_results: u32,
    ) -> Result<Vec<String>, ProviderError> {
        let (_, message_list) = self
            .hub(access_token)
            .users()
            .messages_list("me")
            .q(query)
            .max_results(max_results)
            .doit()
            .await
            .map_err(|e| ProviderError::List(e.to_string()))?;

        let ids: Vec<String> = message_list
            .messages
            .unwrap_or_default()
            .into_iter()
            .filter_map(|m| m.id)
            .collect();

        debug!(
            count = ids.len(),
            more = message_list.next_page_token.is_some(),
            "Listed messages"
        );
        Ok(ids)
    }

    async fn get_message(&self, access_token: &str, id: &str) -> Result<Message, ProviderError> {
        let (_, msg) = self
            .hub(access_token)
            .users()
            .messages_get("me", id)
            .format("full")
            .doit()
            .await
            .map_err(|e| ProviderError::Get {
                id: id.to_string(),
                message: e.to_string(),
            })?;
        Ok(msg)
    }
}
