use crate::{
    bson::{doc, Binary, Bson, Document},
    bson_util,
    client::auth::AuthMechanism,
    cmap::Command,
    error::{Error, Result},
};

/// Opens a SASL conversation.
pub(super) struct SaslStart {
    source: String,
    mechanism: AuthMechanism,
    payload: Vec<u8>,
}

impl SaslStart {
    pub(super) fn new(source: String, mechanism: AuthMechanism, payload: Vec<u8>) -> Self {
        Self {
            source,
            mechanism,
            payload,
        }
    }

    pub(super) fn into_command(self) -> Command {
        let Self {
            source,
            mechanism,
            payload,
        } = self;
        let mut body = doc! {
            "saslStart": 1,
            "mechanism": mechanism.as_str(),
            "payload": Binary::generic(payload),
        };
        // SCRAM is finished once the server signature checks out.
        if matches!(mechanism, AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256) {
            body.insert("options", doc! { "skipEmptyExchange": true });
        }
        Command::new("saslStart", source, body)
    }
}

/// One further step of a conversation opened by [`SaslStart`].
pub(super) struct SaslContinue {
    source: String,
    conversation_id: Bson,
    payload: Vec<u8>,
}

impl SaslContinue {
    pub(super) fn new(source: String, conversation_id: Bson, payload: Vec<u8>) -> Self {
        Self {
            source,
            conversation_id,
            payload,
        }
    }

    pub(super) fn into_command(self) -> Command {
        let body = doc! {
            "saslContinue": 1,
            "conversationId": self.conversation_id,
            "payload": Binary::generic(self.payload),
        };
        Command::new("saslContinue", self.source, body)
    }
}

/// The fields every `saslStart`/`saslContinue` reply carries.
pub(super) struct SaslResponse {
    pub(super) conversation_id: Bson,
    pub(super) done: bool,
    pub(super) payload: Vec<u8>,
}

impl SaslResponse {
    pub(super) fn parse(mechanism: &str, response: &Document) -> Result<Self> {
        let invalid = || Error::invalid_authentication_response(mechanism);

        // A reply without `ok` has already been vetted by the connection.
        match response.get("ok").map(bson_util::get_int) {
            None | Some(Some(1)) => {}
            Some(Some(_)) => {
                let message = response.get_str("errmsg").unwrap_or("Authentication failure");
                return Err(Error::authentication_error(mechanism, message));
            }
            Some(None) => return Err(invalid()),
        }

        Ok(Self {
            conversation_id: response.get("conversationId").cloned().ok_or_else(invalid)?,
            done: response.get("done").and_then(Bson::as_bool).ok_or_else(invalid)?,
            payload: response
                .get_binary_generic("payload")
                .map_err(|_| invalid())?
                .clone(),
        })
    }
}
