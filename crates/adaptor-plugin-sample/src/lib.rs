//! Reference auth plugin.
//!
//! The library exports itself through the in-process ABI, so the same build
//! artefact can be dropped into `<plugins_root>/auth` for the in-process
//! tier or named in `forked_plugins` for the forked tier. Tokens are minted
//! locally from the session credentials; no network service is involved.


use adaptor_config::Capability;
use adaptor_plugins::{CapabilityPlugin, ContextState, Credentials, Operation, Param, PluginFailure};
use tracing::debug;

/// Log target for the sample plugin.
const SAMPLE_TARGET: &str = "adaptor_plugin_sample";

/// URI the plugin registers under.
pub const SAMPLE_URI: &str = "org.example.sample-auth";

/// Plugin error code reported when a context has no usable credentials.
pub const UNAUTHORISED: i32 = 401;

const JOINED_ATTRIBUTE: &str = "joined";

/// Auth plugin that issues serial tokens.
#[derive(Debug, Default)]
pub struct SampleAuthPlugin {
    issued: u64,
}

impl SampleAuthPlugin {
    /// Creates the plugin with no tokens issued.
    #[must_use]
    pub const fn new() -> Self {
        Self { issued: 0 }
    }

    /// Boxed constructor used by the exported entry point.
    #[must_use]
    pub fn boxed() -> Box<dyn CapabilityPlugin> {
        Box::new(Self::new())
    }

    /// Number of tokens minted so far.
    #[must_use]
    pub const fn issued(&self) -> u64 {
        self.issued
    }

    fn mint(&mut self, credentials: &Credentials) -> Result<String, PluginFailure> {
        if credentials.app_secret.is_empty() {
            return Err(PluginFailure::Internal {
                code: UNAUTHORISED,
                message: String::from("application secret is required"),
            });
        }
        self.issued += 1;
        Ok(format!(
            "{}.{}.{}",
            credentials.app_id, credentials.user_id, self.issued
        ))
    }
}

impl CapabilityPlugin for SampleAuthPlugin {
    fn uri(&self) -> &str {
        SAMPLE_URI
    }

    fn capability(&self) -> Capability {
        Capability::Auth
    }

    fn create_context(&mut self, credentials: Credentials) -> Result<ContextState, PluginFailure> {
        debug!(target: SAMPLE_TARGET, user = %credentials.user_id, "context opened");
        Ok(ContextState::new(credentials))
    }

    fn invoke(
        &mut self,
        operation: Operation,
        state: &mut ContextState,
        params: &[Param],
    ) -> Result<Vec<Param>, PluginFailure> {
        match operation {
            Operation::Login => {
                let token = self.mint(state.credentials())?;
                state.set_access_token(token.as_str());
                debug!(
                    target: SAMPLE_TARGET,
                    user = %state.credentials().user_id,
                    "token issued"
                );
                Ok(vec![Param::from(token)])
            }
            Operation::Refresh => {
                if state.access_token().is_none() {
                    return Err(PluginFailure::Internal {
                        code: UNAUTHORISED,
                        message: String::from("refresh requires a prior login"),
                    });
                }
                let token = self.mint(state.credentials())?;
                state.set_access_token(token.as_str());
                Ok(vec![Param::from(token)])
            }
            Operation::IsAuth => Ok(vec![Param::from(state.access_token().is_some())]),
            Operation::Join => {
                let Some(display_name) = params.first().and_then(Param::as_str) else {
                    return Err(PluginFailure::InvalidArgument(String::from(
                        "join expects a display name",
                    )));
                };
                state.set_attribute(JOINED_ATTRIBUTE, display_name);
                Ok(vec![Param::from(state.credentials().user_id.as_str())])
            }
            _ => Err(PluginFailure::Unsupported),
        }
    }
}

adaptor_plugins::export_plugin!(SampleAuthPlugin::boxed);
