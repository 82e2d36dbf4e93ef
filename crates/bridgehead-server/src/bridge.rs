//! Bridge lifecycle.
//!
//! [`Bridge`] parses flags and loads the configuration, then
//! [`Bridge::init`] builds every subsystem into a [`BridgeRuntime`], which
//! owns the start and stop sequences. Fatal conditions come back as
//! [`FatalError`]; only [`Bridge::main`] turns them into an exit status.
//!
//! ```text
//! flags -> config -> init -> start -> (signal) -> stop
//!                      |       |
//!                      |       +- schema upgrades, connection check,
//!                      |          crypto init, then concurrent tasks
//!                      +- appservice, logging, database, state store,
//!                         processor, crypto, matrix handler, backend
//! ```

use std::{
    ffi::OsString,
    future::Future,
    process::ExitCode,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bridgehead_core::{
    BridgeState, BridgeStateErrorMap, BridgeStateEvent, ContentUri, Crypto, Environment, Intent,
    status::register_human_errors,
};
use tracing::{debug, error, info, warn};

use crate::{
    appservice::{AppService, IntentSource},
    child::{BridgeContext, ChildOverride},
    config::{
        BaseConfig, BotConfig, ConfigDocument, REMOVE,
        registration::Registration,
        upgrade::{Helper, Upgrader, do_upgrade, merge_fallback},
    },
    crypto_store::{CryptoStore, NonceSource},
    error::FatalError,
    flags::{Flags, ParsedFlags},
    logging,
    matrix::MatrixHandler,
    processor::{EventProcessor, ExecMode},
    state_store::StateStore,
    status_reporter::{BridgeStateReporter, HttpStateSink, StateSink},
    storage::{Database, Schema},
    version::BridgeInfo,
};

/// Delay between homeserver connection attempts.
pub const RETRY_INTERVAL: Duration = Duration::from_secs(10);

/// Component name of the backend's own tables.
pub const MAIN_COMPONENT: &str = "main";

/// Spec version the homeserver is expected to advertise.
const MODERN_SPEC: (u32, u32) = (1, 1);

/// A bridge before initialization.
pub struct Bridge<E: Environment> {
    info: Arc<BridgeInfo>,
    env: E,
    child: Arc<dyn ChildOverride>,
    flags: Flags,
    document: Arc<ConfigDocument>,
    config: Arc<BaseConfig>,
    intents: Option<Arc<dyn IntentSource>>,
    sink: Option<Arc<dyn StateSink>>,
}

impl<E: Environment> std::fmt::Debug for Bridge<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("name", &self.info.name)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}

struct SetTokens {
    as_token: String,
    hs_token: String,
}

impl Upgrader for SetTokens {
    fn upgrade(&self, helper: &mut Helper<'_>) {
        helper.set(&["appservice", "as_token"], self.as_token.clone());
        helper.set(&["appservice", "hs_token"], self.hs_token.clone());
    }
}

impl<E: Environment> Bridge<E> {
    /// Bridge described by `info` with backend `child`.
    pub fn new(info: BridgeInfo, child: Arc<dyn ChildOverride>, env: E) -> Self {
        Self {
            info: Arc::new(info),
            env,
            child,
            flags: Flags::default(),
            document: Arc::new(ConfigDocument::default()),
            config: Arc::new(BaseConfig::default()),
            intents: None,
            sink: None,
        }
    }

    /// Act through `intents` instead of the appservice's homeserver client.
    pub fn with_intents(mut self, intents: Arc<dyn IntentSource>) -> Self {
        self.intents = Some(intents);
        self
    }

    /// Send bridge states to `sink` instead of `homeserver.status_endpoint`.
    pub fn with_state_sink(mut self, sink: Arc<dyn StateSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Use `flags` without parsing a command line.
    pub fn with_flags(mut self, flags: Flags) -> Self {
        self.flags = flags;
        self
    }

    /// Current flags.
    pub fn flags(&self) -> &Flags {
        &self.flags
    }

    /// Loaded shared configuration.
    pub fn config(&self) -> &BaseConfig {
        &self.config
    }

    /// Run with the process arguments until SIGINT or SIGTERM, then map the
    /// outcome to an exit status.
    pub async fn main(mut self) -> ExitCode {
        match self.run(std::env::args_os(), shutdown_signal()).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                report_fatal(&e);
                ExitCode::from(u8::try_from(e.exit_code()).unwrap_or(1))
            },
        }
    }

    /// The whole bridge run: flags, configuration, optional registration,
    /// init, start, wait for `shutdown`, stop.
    #[allow(clippy::print_stdout, clippy::print_stderr)]
    pub async fn run<I, T>(
        &mut self,
        args: I,
        shutdown: impl Future<Output = ()>,
    ) -> Result<(), FatalError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        self.flags = match Flags::parse_for(&self.info, args)? {
            ParsedFlags::Run(flags) => flags,
            ParsedFlags::Help(text) => {
                print!("{text}");
                return Ok(());
            },
        };
        if self.flags.version {
            println!("{}", self.info.version_desc);
            return Ok(());
        }
        if self.flags.generate_registration && self.flags.no_update {
            return Err(FatalError::IncompatibleFlags);
        }

        self.load_config()?;
        if self.flags.generate_registration {
            self.generate_registration()?;
            return Ok(());
        }

        let runtime = self.init().await?;
        info!("Bridge initialization complete, starting...");
        runtime.start().await?;
        info!("Bridge started!");

        shutdown.await;
        info!("Interrupt received, stopping...");
        runtime.stop().await;
        info!("Bridge stopped.");
        Ok(())
    }

    /// Load and upgrade the configuration file named by the flags.
    ///
    /// The upgraded document is written back unless `--no-update` is set.
    /// When upgrading fails, the example is applied first and the file on
    /// top of it.
    #[allow(clippy::print_stderr)]
    pub fn load_config(&mut self) -> Result<(), FatalError> {
        let example = self.child.example_config();
        let outcome = do_upgrade(&self.flags.config, !self.flags.no_update, example, &[])
            .map_err(FatalError::Config)?;
        if let Some(warning) = &outcome.warning {
            eprintln!("Failed to upgrade config: {warning}");
        }

        let document = if outcome.upgraded {
            ConfigDocument::parse(&outcome.data).map_err(FatalError::Config)?
        } else {
            let merged = merge_fallback(example, &outcome.data).map_err(FatalError::Config)?;
            ConfigDocument::from_table(merged)
        };
        let config = document.base().map_err(FatalError::Config)?;
        self.child.configure(&document).map_err(FatalError::Config)?;

        self.document = Arc::new(document);
        self.config = Arc::new(config);
        Ok(())
    }

    /// Write a registration with fresh tokens and store the tokens in the
    /// configuration file.
    #[allow(clippy::print_stdout)]
    pub fn generate_registration(&self) -> Result<(), FatalError> {
        if self.flags.no_update {
            return Err(FatalError::IncompatibleFlags);
        }
        let registration =
            Registration::generate(&self.config, &self.env).map_err(FatalError::Config)?;
        registration.save(&self.flags.registration).map_err(FatalError::RegistrationSave)?;

        let tokens = SetTokens { as_token: registration.as_token, hs_token: registration.hs_token };
        let outcome = do_upgrade(&self.flags.config, true, self.child.example_config(), &[&tokens])
            .map_err(FatalError::ConfigSave)?;
        if let Some(warning) = outcome.warning {
            return Err(FatalError::ConfigSave(warning));
        }

        println!(
            "Registration generated. See \
             https://spec.matrix.org/latest/application-service-api/#registration \
             for how to install {} on your homeserver.",
            self.flags.registration.display()
        );
        Ok(())
    }

    /// Build every subsystem.
    pub async fn init(&self) -> Result<BridgeRuntime<E>, FatalError> {
        let config = Arc::clone(&self.config);

        let appservice = Arc::new(
            AppService::new(&config, &self.info.user_agent, self.env.random_u64())
                .map_err(FatalError::Config)?,
        );
        if let Some(path) = logging::init(&config.logging, self.env.wall_clock_secs())? {
            info!(path = %path.display(), "logging to file");
        }
        register_human_errors(&self.child.human_errors());

        let db = Database::open(&config.appservice.database.path, self.info.name.clone())
            .map_err(FatalError::Database)?
            .with_ignore_unsupported_database(self.flags.ignore_unsupported_database)
            .with_ignore_foreign_tables(self.flags.ignore_foreign_tables);
        let main_schema =
            Schema { component: MAIN_COMPONENT, versions: self.child.database_tables() };
        db.declare(&main_schema);

        let state_store = StateStore::new(db.clone());
        let intents: Arc<dyn IntentSource> = match &self.intents {
            Some(intents) => Arc::clone(intents),
            None => Arc::clone(&appservice) as Arc<dyn IntentSource>,
        };
        let processor = Arc::new(EventProcessor::new(ExecMode::Sync));

        let crypto_store = CryptoStore::new(
            db.clone(),
            config.bot_user_id(),
            config.ghost_regex().map_err(FatalError::Config)?,
            &config.bridge.encryption.pickle_key,
            nonce_source(self.env.clone()),
        );
        let crypto = if config.bridge.encryption.allow {
            self.child.make_crypto(crypto_store.clone(), intents.bot_intent())
        } else {
            None
        };
        if config.bridge.encryption.allow && crypto.is_none() {
            warn!("encryption is allowed in the config, but the bridge has no encryption engine");
        }

        let matrix = Arc::new(MatrixHandler::new(
            &config,
            Arc::clone(&self.child),
            Arc::clone(&intents),
            state_store.clone(),
            crypto.clone(),
            Arc::downgrade(&processor),
        ));
        matrix.register(&processor);

        let sink = self.sink.clone().or_else(|| {
            config.homeserver.status_endpoint.as_ref().map(|endpoint| {
                let sink = HttpStateSink::new(appservice.client().clone(), endpoint.as_str());
                Arc::new(sink) as Arc<dyn StateSink>
            })
        });
        let reporter = Arc::new(BridgeStateReporter::new(sink, BridgeStateErrorMap::new()));

        let ctx = BridgeContext {
            info: Arc::clone(&self.info),
            config: Arc::clone(&config),
            document: Arc::clone(&self.document),
            db: db.clone(),
            state_store: state_store.clone(),
            intents: Arc::clone(&intents),
            crypto: crypto.clone(),
            reporter: Arc::clone(&reporter),
        };
        self.child.init(ctx).await;

        Ok(BridgeRuntime {
            env: self.env.clone(),
            config,
            child: Arc::clone(&self.child),
            appservice,
            intents,
            db,
            main_schema,
            state_store,
            crypto_store,
            processor,
            _matrix: matrix,
            crypto,
            reporter,
            stopped: AtomicBool::new(false),
        })
    }
}

/// An initialized bridge.
pub struct BridgeRuntime<E: Environment> {
    env: E,
    config: Arc<BaseConfig>,
    child: Arc<dyn ChildOverride>,
    appservice: Arc<AppService>,
    intents: Arc<dyn IntentSource>,
    db: Database,
    main_schema: Schema,
    state_store: StateStore,
    crypto_store: CryptoStore,
    processor: Arc<EventProcessor>,
    // Owned here; the processor only holds it through its handler table.
    _matrix: Arc<MatrixHandler>,
    crypto: Option<Arc<dyn Crypto>>,
    reporter: Arc<BridgeStateReporter>,
    stopped: AtomicBool,
}

impl<E: Environment> std::fmt::Debug for BridgeRuntime<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRuntime")
            .field("ready", &self.is_ready())
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<E: Environment> BridgeRuntime<E> {
    /// Upgrade schemas, verify the homeserver connection, start every
    /// subsystem and mark the bridge ready.
    ///
    /// Long-running subsystems are spawned; this returns once they are
    /// launched.
    pub async fn start(&self) -> Result<(), FatalError> {
        debug!("running database upgrades");
        self.db.upgrade(&self.main_schema).map_err(|source| FatalError::DatabaseUpgrade {
            component: "main database".to_string(),
            source,
        })?;
        self.state_store.upgrade().map_err(|source| FatalError::DatabaseUpgrade {
            component: "matrix state store".to_string(),
            source,
        })?;
        if self.crypto.is_some() {
            self.crypto_store.upgrade().map_err(|source| FatalError::DatabaseUpgrade {
                component: "crypto store".to_string(),
                source,
            })?;
        }

        debug!("checking connection to homeserver");
        ensure_connection(&self.env, self.intents.bot_intent().as_ref()).await?;

        if let Some(crypto) = &self.crypto {
            crypto.init().await.map_err(FatalError::CryptoInit)?;
        }

        debug!("starting application service");
        tokio::spawn(Arc::clone(&self.appservice).start());

        debug!("starting event processor");
        match self.appservice.take_events() {
            Some(events) => {
                let processor = Arc::clone(&self.processor);
                tokio::spawn(async move { processor.start(events).await });
            },
            None => warn!("event channel already taken, not starting event processor"),
        }

        let bot = self.intents.bot_intent();
        let bot_config = self.config.appservice.bot.clone();
        tokio::spawn(async move { update_bot_profile(bot.as_ref(), &bot_config).await });

        if let Some(crypto) = &self.crypto {
            debug!("starting end-to-bridge encryption");
            let crypto = Arc::clone(crypto);
            tokio::spawn(async move { crypto.start().await });
        }

        self.child.start().await;
        self.appservice.set_ready(true);
        let running = BridgeState::new(BridgeStateEvent::Running);
        self.reporter.send(running, None, self.env.wall_clock_secs()).await;
        Ok(())
    }

    /// Stop every subsystem: encryption, appservice, event processor, then
    /// the backend. Only the first call does anything.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("bridge already stopped");
            return;
        }
        if let Some(crypto) = &self.crypto {
            crypto.stop().await;
        }
        self.appservice.set_ready(false);
        self.appservice.stop();
        self.processor.stop();
        self.child.stop().await;
    }

    /// True between a successful start and stop.
    pub fn is_ready(&self) -> bool {
        self.appservice.is_ready()
    }

    /// The appservice endpoint.
    pub fn appservice(&self) -> &Arc<AppService> {
        &self.appservice
    }

    /// The event processor.
    pub fn processor(&self) -> &Arc<EventProcessor> {
        &self.processor
    }

    /// Bridge-state reporting.
    pub fn reporter(&self) -> &Arc<BridgeStateReporter> {
        &self.reporter
    }

    /// The state store.
    pub fn state_store(&self) -> &StateStore {
        &self.state_store
    }

    /// The crypto store.
    pub fn crypto_store(&self) -> &CryptoStore {
        &self.crypto_store
    }
}

/// Wait until the homeserver answers and accepts the bot's credentials.
///
/// Transport failures are retried every [`RETRY_INTERVAL`] without limit.
/// A rejected token or namespace and an unexpected identity are fatal.
pub async fn ensure_connection<E: Environment>(
    env: &E,
    bot: &dyn Intent,
) -> Result<(), FatalError> {
    // Versions only gates reachability, so a failing whoami does not go back to it.
    loop {
        match bot.versions().await {
            Ok(versions) => {
                if !versions.supports(MODERN_SPEC.0, MODERN_SPEC.1) {
                    warn!("Server isn't advertising modern spec versions");
                }
                break;
            },
            Err(e) => {
                error!(error = %e, "Failed to connect to homeserver, retrying in 10 seconds...");
                env.sleep(RETRY_INTERVAL).await;
            },
        }
    }

    loop {
        match bot.whoami().await {
            Ok(whoami) if whoami.user_id != *bot.user_id() => {
                return Err(FatalError::WrongIdentity {
                    expected: bot.user_id().clone(),
                    actual: whoami.user_id,
                });
            },
            Ok(_) => return Ok(()),
            Err(e) if e.is_unknown_token() => return Err(FatalError::TokenRejected),
            Err(e) if e.is_exclusive() => return Err(FatalError::NamespaceRejected),
            Err(e) => {
                error!(error = %e, "Failed to connect to homeserver, retrying in 10 seconds...");
                env.sleep(RETRY_INTERVAL).await;
            },
        }
    }
}

/// Apply the configured avatar and display name to the bot.
///
/// [`REMOVE`] clears a field and an empty value leaves it alone. Failures
/// are only logged.
pub async fn update_bot_profile(bot: &dyn Intent, config: &BotConfig) {
    let avatar =
        if config.avatar == REMOVE { Some(ContentUri::default()) } else { config.parsed_avatar() };
    if let Some(avatar) = avatar {
        if let Err(e) = bot.set_avatar_url(&avatar).await {
            warn!(error = %e, "Failed to update bot avatar");
        }
    }

    let displayname = match config.displayname.as_str() {
        REMOVE => Some(""),
        "" => None,
        name => Some(name),
    };
    if let Some(displayname) = displayname {
        if let Err(e) = bot.set_display_name(displayname).await {
            warn!(error = %e, "Failed to update bot displayname");
        }
    }
}

/// Resolves on SIGINT, or SIGTERM on Unix.
pub async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {},
                    _ = sigterm.recv() => {},
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                if let Err(e) = tokio::signal::ctrl_c().await {
                    error!(error = %e, "failed to listen for SIGINT");
                }
            },
        }
    }
    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for SIGINT");
        }
    }
}

/// Print a fatal error and its remediation hint.
#[allow(clippy::print_stderr)]
pub fn report_fatal(err: &FatalError) {
    error!(exit_code = err.exit_code(), "{err}");
    eprintln!("{err}");
    if let Some(hint) = err.hint() {
        eprintln!("{hint}");
    }
}

fn nonce_source<E: Environment>(env: E) -> NonceSource {
    Arc::new(move |buf: &mut [u8]| env.random_bytes(buf))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use bridgehead_core::{EventId, EventType, IntentError, RoomId, UserId, Versions, Whoami};
    use serde_json::Value;

    use super::*;

    #[derive(Default)]
    struct ProfileIntent {
        user_id: UserId,
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl Intent for ProfileIntent {
        fn user_id(&self) -> &UserId {
            &self.user_id
        }
        async fn versions(&self) -> Result<Versions, IntentError> {
            Ok(Versions::default())
        }
        async fn whoami(&self) -> Result<Whoami, IntentError> {
            Err(IntentError::Transport("unused".to_string()))
        }
        async fn set_avatar_url(&self, uri: &ContentUri) -> Result<(), IntentError> {
            self.calls.lock().unwrap().push(format!("avatar:{uri}"));
            Err(IntentError::Transport("down".to_string()))
        }
        async fn set_display_name(&self, name: &str) -> Result<(), IntentError> {
            self.calls.lock().unwrap().push(format!("name:{name}"));
            Ok(())
        }
        async fn join_room(&self, _room_id: &RoomId) -> Result<(), IntentError> {
            Ok(())
        }
        async fn send_message_event(
            &self,
            _: &RoomId,
            _: &EventType,
            _: &Value,
        ) -> Result<EventId, IntentError> {
            Ok(EventId::default())
        }
    }

    fn bot(avatar: &str, displayname: &str) -> BotConfig {
        BotConfig {
            avatar: avatar.to_string(),
            displayname: displayname.to_string(),
            ..BotConfig::default()
        }
    }

    #[tokio::test]
    async fn profile_values_are_applied() {
        let intent = ProfileIntent::default();
        update_bot_profile(&intent, &bot("mxc://example.com/abc", "Bridge bot")).await;
        assert_eq!(
            *intent.calls.lock().unwrap(),
            ["avatar:mxc://example.com/abc", "name:Bridge bot"]
        );
    }

    #[tokio::test]
    async fn remove_clears_fields() {
        let intent = ProfileIntent::default();
        update_bot_profile(&intent, &bot(REMOVE, REMOVE)).await;
        assert_eq!(*intent.calls.lock().unwrap(), ["avatar:", "name:"]);
    }

    #[tokio::test]
    async fn empty_and_malformed_values_are_skipped() {
        let intent = ProfileIntent::default();
        update_bot_profile(&intent, &bot("not-a-uri", "")).await;
        assert!(intent.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn token_upgrader_sets_both_tokens() {
        let user = toml::Table::new();
        let mut helper = Helper::new(toml_edit::DocumentMut::new(), &user);
        SetTokens { as_token: "a".to_string(), hs_token: "h".to_string() }.upgrade(&mut helper);
        let appservice = helper.output()["appservice"].as_table().unwrap();
        assert_eq!(appservice["as_token"].as_str(), Some("a"));
        assert_eq!(appservice["hs_token"].as_str(), Some("h"));
    }
}
