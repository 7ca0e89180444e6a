//! Test case lifecycle, context and registry.
//!
//! [`TestCase`] is implemented by every validation scenario. The runner
//! drives it through
//!
//! ```text
//! prepare() → execute() → cleanup(verdict)
//! ```
//!
//! where `cleanup` runs whatever happened before it. [`DynTestCase`] is the
//! dyn-compatible mirror used by [`TestRegistry`] to hold heterogeneous
//! cases.

use std::ffi::OsString;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use clap::error::ErrorKind;
use clap::{Command, Parser};
use serde::Serialize;

use crate::config::PlatvalConfig;
use crate::error::{PlatvalError, RegistryError, TestError};
use crate::exec::{BoxFuture, SutExecutor};
use crate::power::PowerControl;
use crate::types::{OsType, Verdict};

// ─── TestCaseInfo ────────────────────────────────────────────────────

/// Static description of a test case.
#[derive(Debug, Clone, Serialize)]
pub struct TestCaseInfo {
    /// Stable id used on the command line, e.g. `driver-install-cycle`
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub tags: &'static [&'static str],
    pub supported_os: &'static [OsType],
}

impl TestCaseInfo {
    pub fn supports(&self, os: OsType) -> bool {
        self.supported_os.contains(&os)
    }
}

// ─── case arguments ──────────────────────────────────────────────────

/// Parses a case's command-line tokens into its clap `Args` struct.
///
/// `id` stands in for the program name, so usage and help read
/// `platval run <id> ...`. `--help` comes back as [`RegistryError::Help`]
/// carrying the rendered text.
pub fn parse_case_args<A, I, T>(id: &str, tokens: I) -> Result<A, RegistryError>
where
    A: Parser,
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    let argv = std::iter::once(OsString::from(id)).chain(tokens.into_iter().map(Into::into));
    A::try_parse_from(argv).map_err(|e| {
        let text = e.render().to_string();
        match e.kind() {
            ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => RegistryError::Help {
                id: id.to_owned(),
                text,
            },
            _ => RegistryError::InvalidArgs {
                id: id.to_owned(),
                reason: text.trim_end().to_owned(),
            },
        }
    })
}

// ─── TestContext ─────────────────────────────────────────────────────

/// Everything a test case may touch while it runs.
pub struct TestContext {
    pub sut: Arc<dyn SutExecutor>,
    /// Peer SUT for two-machine scenarios
    pub sut2: Option<Arc<dyn SutExecutor>>,
    /// The controlling host
    pub host: Arc<dyn SutExecutor>,
    pub power: Arc<dyn PowerControl>,
    pub config: Arc<PlatvalConfig>,
    pub dry_run: bool,
    notes: Mutex<Vec<String>>,
}

impl TestContext {
    pub fn new(
        sut: Arc<dyn SutExecutor>,
        host: Arc<dyn SutExecutor>,
        power: Arc<dyn PowerControl>,
        config: Arc<PlatvalConfig>,
    ) -> Self {
        Self {
            sut,
            sut2: None,
            host,
            power,
            config,
            dry_run: false,
            notes: Mutex::new(Vec::new()),
        }
    }

    pub fn with_sut2(mut self, sut2: Arc<dyn SutExecutor>) -> Self {
        self.sut2 = Some(sut2);
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn os(&self) -> OsType {
        self.sut.os_type()
    }

    /// Default per-command timeout.
    pub fn timeout(&self) -> Duration {
        self.config.timeouts.command()
    }

    /// The peer SUT, or `NotApplicable` when none is configured.
    pub fn require_sut2(&self) -> Result<Arc<dyn SutExecutor>, PlatvalError> {
        self.sut2.clone().ok_or_else(|| {
            TestError::NotApplicable("scenario needs a second SUT ([sut2] section)".to_owned())
                .into()
        })
    }

    /// Attaches an observation to the run report.
    pub fn note(&self, message: impl Into<String>) {
        self.notes
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(message.into());
    }

    pub fn take_notes(&self) -> Vec<String> {
        std::mem::take(&mut *self.notes.lock().unwrap_or_else(|p| p.into_inner()))
    }

    /// Sleeps unless this is a dry run.
    pub async fn settle(&self, duration: Duration) {
        if !self.dry_run && !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

// ─── TestCase ────────────────────────────────────────────────────────

/// A validation scenario.
///
/// ```ignore
/// struct PingPeer { info: TestCaseInfo }
///
/// impl TestCase for PingPeer {
///     fn info(&self) -> &TestCaseInfo { &self.info }
///
///     async fn execute(&mut self, ctx: &TestContext) -> Result<(), PlatvalError> {
///         ctx.sut.execute_checked("ping -c 4 10.0.0.1", ctx.timeout()).await?;
///         Ok(())
///     }
/// }
/// ```
pub trait TestCase: Send + Sync {
    fn info(&self) -> &TestCaseInfo;

    /// Establishes preconditions. A failure here skips `execute`.
    fn prepare(
        &mut self,
        _ctx: &TestContext,
    ) -> impl Future<Output = Result<(), PlatvalError>> + Send {
        async { Ok(()) }
    }

    fn execute(
        &mut self,
        ctx: &TestContext,
    ) -> impl Future<Output = Result<(), PlatvalError>> + Send;

    /// Restores the SUT. Always called once prepare has been attempted,
    /// with the verdict reached so far.
    fn cleanup(
        &mut self,
        _ctx: &TestContext,
        _verdict: Verdict,
    ) -> impl Future<Output = Result<(), PlatvalError>> + Send {
        async { Ok(()) }
    }
}

/// dyn-compatible [`TestCase`].
pub trait DynTestCase: Send + Sync {
    fn info(&self) -> &TestCaseInfo;

    fn prepare<'a>(&'a mut self, ctx: &'a TestContext) -> BoxFuture<'a, Result<(), PlatvalError>>;

    fn execute<'a>(&'a mut self, ctx: &'a TestContext) -> BoxFuture<'a, Result<(), PlatvalError>>;

    fn cleanup<'a>(
        &'a mut self,
        ctx: &'a TestContext,
        verdict: Verdict,
    ) -> BoxFuture<'a, Result<(), PlatvalError>>;
}

impl<T: TestCase> DynTestCase for T {
    fn info(&self) -> &TestCaseInfo {
        TestCase::info(self)
    }

    fn prepare<'a>(&'a mut self, ctx: &'a TestContext) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(TestCase::prepare(self, ctx))
    }

    fn execute<'a>(&'a mut self, ctx: &'a TestContext) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(TestCase::execute(self, ctx))
    }

    fn cleanup<'a>(
        &'a mut self,
        ctx: &'a TestContext,
        verdict: Verdict,
    ) -> BoxFuture<'a, Result<(), PlatvalError>> {
        Box::pin(TestCase::cleanup(self, ctx, verdict))
    }
}

// ─── TestRegistry ────────────────────────────────────────────────────

/// Builds a test case from its raw command-line tokens.
pub type CaseFactory =
    Box<dyn Fn(&[String]) -> Result<Box<dyn DynTestCase>, PlatvalError> + Send + Sync>;

struct Registered {
    info: TestCaseInfo,
    usage: fn() -> Command,
    factory: CaseFactory,
}

/// Registered test cases, in registration order.
pub struct TestRegistry {
    cases: Vec<Registered>,
}

impl TestRegistry {
    pub fn new() -> Self {
        Self { cases: Vec::new() }
    }

    /// Registers a case under `info.id`. Its tokens are parsed into `A`
    /// and handed to `build`. Duplicate ids are rejected.
    pub fn register<A, C, F>(&mut self, info: TestCaseInfo, build: F) -> Result<(), RegistryError>
    where
        A: Parser + 'static,
        C: TestCase + 'static,
        F: Fn(A) -> Result<C, PlatvalError> + Send + Sync + 'static,
    {
        if self.cases.iter().any(|c| c.info.id == info.id) {
            return Err(RegistryError::AlreadyRegistered {
                id: info.id.to_owned(),
            });
        }
        let id = info.id;
        let factory: CaseFactory = Box::new(move |tokens| {
            let args = parse_case_args::<A, _, _>(id, tokens)?;
            Ok(Box::new(build(args)?) as Box<dyn DynTestCase>)
        });
        self.cases.push(Registered {
            info,
            usage: A::command,
            factory,
        });
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<&TestCaseInfo> {
        self.find(id).map(|c| &c.info)
    }

    pub fn list(&self) -> Vec<&TestCaseInfo> {
        self.cases.iter().map(|c| &c.info).collect()
    }

    pub fn count(&self) -> usize {
        self.cases.len()
    }

    /// The clap command describing the case's arguments.
    pub fn usage(&self, id: &str) -> Option<Command> {
        self.find(id).map(|c| (c.usage)().name(c.info.id))
    }

    /// Parses `tokens` and builds the case registered under `id`.
    pub fn create(&self, id: &str, tokens: &[String]) -> Result<Box<dyn DynTestCase>, PlatvalError> {
        let entry = self
            .find(id)
            .ok_or_else(|| RegistryError::NotFound { id: id.to_owned() })?;
        (entry.factory)(tokens)
    }

    fn find(&self, id: &str) -> Option<&Registered> {
        self.cases.iter().find(|c| c.info.id == id)
    }
}

impl Default for TestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Parser)]
    struct UpdateArgs {
        #[arg(long)]
        capsule_path: String,
        #[arg(long = "loop", default_value_t = 1, value_parser = clap::value_parser!(u32).range(1..))]
        loops: u32,
        #[arg(long)]
        warm_reset: bool,
    }

    fn parse(tokens: &[&str]) -> Result<UpdateArgs, RegistryError> {
        parse_case_args("capsule-update", tokens.iter().copied())
    }

    #[test]
    fn parse_values_flags_and_inline() {
        let args = parse(&["--capsule-path", "/tmp/a.cap", "--warm-reset", "--loop=3"]).unwrap();
        assert_eq!(args.capsule_path, "/tmp/a.cap");
        assert!(args.warm_reset);
        assert_eq!(args.loops, 3);
    }

    #[test]
    fn parse_rejects_unknown_argument() {
        let err = parse(&["--capsule-path", "a", "--bogus", "1"]).unwrap_err();
        assert!(matches!(err, RegistryError::InvalidArgs { .. }));
        assert!(err.to_string().contains("--bogus"));
    }

    #[test]
    fn parse_rejects_missing_required() {
        let err = parse(&["--loop", "2"]).unwrap_err();
        assert!(err.to_string().contains("--capsule-path"));
    }

    #[test]
    fn parse_rejects_flag_with_inline_value() {
        assert!(parse(&["--capsule-path", "a", "--warm-reset=on"]).is_err());
    }

    #[test]
    fn parse_rejects_repeated_option_and_out_of_range() {
        assert!(parse(&["--capsule-path", "a", "--loop", "2", "--loop", "5"]).is_err());
        assert!(parse(&["--capsule-path", "a", "--loop", "0"]).is_err());
    }

    #[test]
    fn help_is_reported_separately() {
        let err = parse(&["--help"]).unwrap_err();
        let RegistryError::Help { id, text } = err else {
            panic!("expected help, got {err:?}");
        };
        assert_eq!(id, "capsule-update");
        assert!(text.contains("--capsule-path"));
    }

    struct Noop {
        info: TestCaseInfo,
    }

    #[derive(Debug, Parser)]
    struct NoArgs {}

    const NOOP_INFO: TestCaseInfo = TestCaseInfo {
        id: "noop",
        name: "No-op",
        description: "does nothing",
        tags: &["smoke"],
        supported_os: &[OsType::Linux, OsType::Windows],
    };

    impl TestCase for Noop {
        fn info(&self) -> &TestCaseInfo {
            &self.info
        }

        async fn execute(&mut self, _ctx: &TestContext) -> Result<(), PlatvalError> {
            Ok(())
        }
    }

    fn noop(_args: NoArgs) -> Result<Noop, PlatvalError> {
        Ok(Noop { info: NOOP_INFO })
    }

    #[test]
    fn registry_rejects_duplicates() {
        let mut registry = TestRegistry::new();
        registry.register(NOOP_INFO, noop).unwrap();
        let err = registry.register(NOOP_INFO, noop).unwrap_err();
        assert!(matches!(err, RegistryError::AlreadyRegistered { .. }));
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn registry_create_and_lookup() {
        let mut registry = TestRegistry::new();
        registry.register(NOOP_INFO, noop).unwrap();
        assert!(registry.get("noop").is_some());
        assert_eq!(registry.usage("noop").unwrap().get_name(), "noop");
        let case = registry.create("noop", &[]).unwrap();
        assert_eq!(case.info().id, "noop");
        assert!(registry.create("noop", &["stray".to_owned()]).is_err());
        assert!(matches!(
            registry.create("missing", &[]),
            Err(PlatvalError::Registry(RegistryError::NotFound { .. }))
        ));
    }

    #[test]
    fn info_supports_os() {
        assert!(NOOP_INFO.supports(OsType::Windows));
        assert!(!NOOP_INFO.supports(OsType::Esxi));
    }
}
