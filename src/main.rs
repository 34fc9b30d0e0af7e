#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate loggerv;
extern crate libc;

extern crate leger;

use leger::*;

use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use std::process;

use leger::paths::{Layout, Scope};

fn print_error_debug(e: &Error) {
    // unwind the error chain for the user
    for cause in e.iter().skip(1) {
        warn!("caused by: {}", cause);
    }
}

/// Exit codes: 1 generic, 2 validation, 3 auth, 4 external service
fn exit_code(e: &Error) -> i32 {
    match e.kind() {
        ErrorKind::ValidationFailed(_)
        | ErrorKind::UnitSyntaxError(_, _)
        | ErrorKind::ManifestInvalid(_)
        | ErrorKind::NoQuadletFiles(_) => 2,
        ErrorKind::NotAuthenticated | ErrorKind::TokenRejected | ErrorKind::AccountNotLinked => 3,
        ErrorKind::DaemonUnavailable | ErrorKind::CatalogHttpError(_, _) => 4,
        _ => 1,
    }
}

/// Remediation hints, attached where the user sees the error
fn hint(e: &Error) -> Option<String> {
    match e.kind() {
        ErrorKind::NotAuthenticated => Some("run `leger login --identity <token>` first".into()),
        ErrorKind::TokenRejected => {
            Some("the catalog rejected the stored token - run `leger login` again".into())
        }
        ErrorKind::DaemonUnavailable => {
            Some("check the daemon: `systemctl --user status leger-secretd`".into())
        }
        ErrorKind::SupervisorError(_, svc) => Some(format!(
            "inspect it with `systemctl --user status {}` and `journalctl --user -u {}`",
            svc, svc
        )),
        ErrorKind::CatalogHttpError(_, _) => {
            Some(format!("check catalog availability: `curl {}/health`", paths::catalog_base()))
        }
        ErrorKind::FatalRollbackFailed(_, _) => {
            Some("list safety snapshots with `leger backup list` and restore manually".into())
        }
        _ => None,
    }
}

fn main() {
    let app = App::new("leger")
        .version(crate_version!())
        .setting(AppSettings::VersionlessSubcommands)
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .setting(AppSettings::ColoredHelp)
        .setting(AppSettings::DeriveDisplayOrder)
        .global_settings(&[AppSettings::ColoredHelp])
        .about("Quadlet deployment manager")
        .arg(Arg::with_name("verbose")
            .short("v")
            .multiple(true)
            .help("Increase verbosity"))
        .arg(Arg::with_name("debug")
            .short("d")
            .long("debug")
            .help("Adds line numbers to log statements"))
        .arg(Arg::with_name("system")
            .long("system")
            .help("Operate on system scope instead of the user session"))

        .subcommand(SubCommand::with_name("install")
            .about("Install a bundle from a source (git url, catalog, local path)")
            .arg(Arg::with_name("source")
                .help("Source to install from; empty uses your latest catalog bundle"))
            .arg(Arg::with_name("branch")
                .short("b")
                .long("branch")
                .takes_value(true)
                .help("Git branch when the url does not pin one")))
        .subcommand(SubCommand::with_name("stage")
            .about("Stage an update for an installed deployment")
            .arg(Arg::with_name("source")
                .help("Source to stage from; empty uses your latest catalog bundle"))
            .arg(Arg::with_name("branch")
                .short("b")
                .long("branch")
                .takes_value(true)
                .help("Git branch when the url does not pin one")))
        .subcommand(SubCommand::with_name("apply")
            .about("Apply the staged update (with safety backup and rollback)")
            .arg(Arg::with_name("name")
                .required(true)
                .help("Deployment name")))
        .subcommand(SubCommand::with_name("diff")
            .about("Show what apply would change")
            .arg(Arg::with_name("name")
                .required(true)
                .help("Deployment name")))
        .subcommand(SubCommand::with_name("discard")
            .about("Throw away the staged update")
            .arg(Arg::with_name("name")
                .required(true)
                .help("Deployment name")))
        .subcommand(SubCommand::with_name("remove")
            .about("Stop and remove a deployment")
            .arg(Arg::with_name("name")
                .required(true)
                .help("Deployment name")))
        .subcommand(SubCommand::with_name("list")
            .about("List active deployments"))
        .subcommand(SubCommand::with_name("staged")
            .about("List staged updates"))
        .subcommand(SubCommand::with_name("show")
            .about("Show one deployment's trees and backups")
            .arg(Arg::with_name("name")
                .required(true)
                .help("Deployment name")))
        .subcommand(SubCommand::with_name("status")
            .about("Service and health status for a deployment")
            .arg(Arg::with_name("name")
                .required(true)
                .help("Deployment name")))
        .subcommand(SubCommand::with_name("graph")
            .about("Graph the dependencies of a deployment")
            .arg(Arg::with_name("name")
                .required(true)
                .help("Deployment name"))
            .arg(Arg::with_name("dot")
                .long("dot")
                .help("Generate dot output for graphviz")))
        .subcommand(SubCommand::with_name("logs")
            .about("Tail journal logs for a deployment's service")
            .arg(Arg::with_name("name")
                .required(true)
                .help("Deployment name"))
            .arg(Arg::with_name("service")
                .help("Specific service (defaults to the deployment's main unit)"))
            .arg(Arg::with_name("lines")
                .short("n")
                .long("lines")
                .takes_value(true)
                .help("Number of journal lines (default 50)"))
            .arg(Arg::with_name("follow")
                .short("f")
                .long("follow")
                .help("Keep following the journal")))
        .subcommand(SubCommand::with_name("validate")
            .about("Validate a bundle directory")
            .arg(Arg::with_name("path")
                .required(true)
                .help("Bundle directory")))

        .subcommand(SubCommand::with_name("backup")
            .setting(AppSettings::SubcommandRequiredElseHelp)
            .about("Snapshot and restore deployments")
            .subcommand(SubCommand::with_name("create")
                .arg(Arg::with_name("name")
                    .required(true)
                    .help("Deployment name"))
                .arg(Arg::with_name("reason")
                    .short("r")
                    .long("reason")
                    .takes_value(true)
                    .help("Reason recorded in the snapshot (default manual)"))
                .about("Snapshot unit files and volumes"))
            .subcommand(SubCommand::with_name("list")
                .arg(Arg::with_name("name")
                    .help("Only list backups of this deployment"))
                .about("List backups, newest first"))
            .subcommand(SubCommand::with_name("restore")
                .arg(Arg::with_name("id")
                    .required(true)
                    .help("Backup id, <deployment>-<timestamp>"))
                .about("Restore a deployment from a backup"))
            .subcommand(SubCommand::with_name("remove")
                .arg(Arg::with_name("id")
                    .required(true)
                    .help("Backup id"))
                .about("Delete a backup"))
            .subcommand(SubCommand::with_name("prune")
                .arg(Arg::with_name("name")
                    .required(true)
                    .help("Deployment name"))
                .arg(Arg::with_name("keep")
                    .short("k")
                    .long("keep")
                    .takes_value(true)
                    .help("How many newest backups to keep (default 3)"))
                .about("Delete all but the newest backups")))

        .subcommand(SubCommand::with_name("secrets")
            .setting(AppSettings::SubcommandRequiredElseHelp)
            .about("Catalog secrets and local daemon reconciliation")
            .subcommand(SubCommand::with_name("sync")
                .arg(Arg::with_name("force")
                    .long("force")
                    .help("Push secrets even when versions match"))
                .arg(Arg::with_name("dry-run")
                    .long("dry-run")
                    .help("Only print the plan"))
                .about("Reconcile catalog secrets into the local daemon"))
            .subcommand(SubCommand::with_name("list")
                .about("List catalog secret metadata"))
            .subcommand(SubCommand::with_name("get")
                .arg(Arg::with_name("name")
                    .required(true)
                    .help("Secret name"))
                .about("Fetch one secret value"))
            .subcommand(SubCommand::with_name("set")
                .arg(Arg::with_name("name")
                    .required(true)
                    .help("Secret name"))
                .arg(Arg::with_name("value")
                    .required(true)
                    .help("Secret value"))
                .about("Create or update a secret"))
            .subcommand(SubCommand::with_name("delete")
                .arg(Arg::with_name("name")
                    .required(true)
                    .help("Secret name"))
                .about("Delete a secret")))

        .subcommand(SubCommand::with_name("versions")
            .about("List your published catalog bundle versions"))
        .subcommand(SubCommand::with_name("login")
            .about("Exchange an identity token for catalog credentials")
            .arg(Arg::with_name("identity")
                .long("identity")
                .takes_value(true)
                .required(true)
                .help("Identity token from your provider")))
        .subcommand(SubCommand::with_name("logout")
            .about("Forget stored catalog credentials"))
        .subcommand(SubCommand::with_name("whoami")
            .about("Show the stored identity"))
        .subcommand(SubCommand::with_name("doctor")
            .about("Check host tooling, daemon and catalog availability"))
        .subcommand(SubCommand::with_name("clean")
            .about("Remove the whole staged tree"));

    let args = app.get_matches();
    let name = args.subcommand_name().unwrap();
    let _ = run(&args).map_err(|e| {
        error!("{} error: {}", name, e);
        print_error_debug(&e);
        if let Some(h) = hint(&e) {
            info!("{}", h);
        }
        process::exit(exit_code(&e));
    });
    process::exit(0);
}

fn run(args: &ArgMatches) -> Result<()> {
    loggerv::Logger::new()
        .verbosity(args.occurrences_of("verbose") + 1)
        .module_path(false)
        .line_numbers(args.is_present("debug"))
        .init()
        .unwrap();
    leger::init()?;

    // Ignore SIGPIPE errors to avoid having to use let _ = write! everywhere
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }

    let scope = if args.is_present("system") { Scope::System } else { Scope::User };
    let layout = Layout::resolve(scope)?;

    dispatch_commands(args, &layout, scope)
}

/// Stored identity, when there is one
fn identity(layout: &Layout) -> Result<Option<auth::AuthRecord>> {
    auth::load(layout)
}

/// Catalog client carrying the stored token (if any)
fn catalog_client(layout: &Layout) -> Result<catalog::Catalog> {
    let token = identity(layout)?.map(|r| r.token);
    catalog::Catalog::new(token)
}

/// Dispatch clap arguments to leger handlers
fn dispatch_commands(args: &ArgMatches, layout: &Layout, scope: Scope) -> Result<()> {
    // listers and read-only helpers first
    if args.subcommand_matches("list").is_some() {
        return list::deployments(layout);
    }
    if args.subcommand_matches("staged").is_some() {
        return list::staged(layout);
    }
    if let Some(a) = args.subcommand_matches("show") {
        return list::show(layout, a.value_of("name").unwrap());
    }
    if let Some(a) = args.subcommand_matches("validate") {
        let res = validate::bundle(std::path::Path::new(a.value_of("path").unwrap()))?;
        res.print()?;
        if !res.valid {
            return Err(ErrorKind::ValidationFailed(a.value_of("path").unwrap().into()).into());
        }
        return Ok(());
    }
    if let Some(a) = args.subcommand_matches("diff") {
        let name = a.value_of("name").unwrap();
        let active = layout.active_root().join(name);
        let staged = layout.staged_root().join(name);
        if !staging::is_staged(layout, name) {
            return Err(ErrorKind::StagedUpdatesMissing(name.into()).into());
        }
        let d = diff::trees(&active, &staged)?;
        return d.print();
    }
    if let Some(a) = args.subcommand_matches("status") {
        let rep = status::report(layout, scope, a.value_of("name").unwrap())?;
        return rep.print();
    }
    if let Some(a) = args.subcommand_matches("graph") {
        let name = a.value_of("name").unwrap();
        let active = layout.active_root().join(name);
        if !active.is_dir() {
            return Err(ErrorKind::NotDeployed(name.into()).into());
        }
        let units = quadlet::discover(&active)?;
        if a.is_present("dot") {
            print!("{}", graph::dot(&units));
        } else {
            let analysis = graph::analyze(&units);
            print!("{}", serde_yaml::to_string(&analysis)?);
        }
        return Ok(());
    }
    if let Some(a) = args.subcommand_matches("logs") {
        let name = a.value_of("name").unwrap();
        let svc = a.value_of("service").unwrap_or(name);
        let lines = value_t!(a.value_of("lines"), u32).unwrap_or(50);
        return systemctl::logs(scope, svc, lines, a.is_present("follow"));
    }

    // lifecycle
    if let Some(a) = args.subcommand_matches("install") {
        let src = a.value_of("source").unwrap_or("");
        let id = identity(layout)?;
        let user = id.as_ref().map(|r| r.user_id.clone());
        let token = id.map(|r| r.token);
        let name = deploy::install(layout, scope, src, user.as_ref().map(|s| s.as_str()), token, a.value_of("branch"))?;
        print!("installed {}\n", name);
        return Ok(());
    }
    if let Some(a) = args.subcommand_matches("stage") {
        let src = a.value_of("source").unwrap_or("");
        let id = identity(layout)?;
        let user = id.as_ref().map(|r| r.user_id.clone());
        let token = id.map(|r| r.token);
        let name = deploy::stage(layout, src, user.as_ref().map(|s| s.as_str()), token, a.value_of("branch"))?;
        print!("staged update for {} - review with `leger diff {}`\n", name, name);
        return Ok(());
    }
    if let Some(a) = args.subcommand_matches("apply") {
        return deploy::apply(layout, scope, a.value_of("name").unwrap());
    }
    if let Some(a) = args.subcommand_matches("discard") {
        return deploy::discard(layout, a.value_of("name").unwrap());
    }
    if let Some(a) = args.subcommand_matches("remove") {
        return deploy::remove(layout, scope, a.value_of("name").unwrap());
    }
    if args.subcommand_matches("clean").is_some() {
        return staging::clean(layout);
    }

    // backups
    if let Some(a) = args.subcommand_matches("backup") {
        if let Some(b) = a.subcommand_matches("create") {
            let meta = backup::create(
                layout,
                b.value_of("name").unwrap(),
                b.value_of("reason").unwrap_or("manual"),
            )?;
            print!("created {}\n", meta.id);
            return Ok(());
        }
        if let Some(b) = a.subcommand_matches("list") {
            return list::backups(layout, b.value_of("name"));
        }
        if let Some(b) = a.subcommand_matches("restore") {
            return deploy::restore(layout, scope, b.value_of("id").unwrap());
        }
        if let Some(b) = a.subcommand_matches("remove") {
            return backup::remove(layout, b.value_of("id").unwrap());
        }
        if let Some(b) = a.subcommand_matches("prune") {
            let keep = value_t!(b.value_of("keep"), usize).unwrap_or(3);
            let removed = backup::prune(layout, b.value_of("name").unwrap(), keep)?;
            print!("pruned {} backups\n", removed);
            return Ok(());
        }
    }

    // secrets and auth need the catalog
    if let Some(a) = args.subcommand_matches("secrets") {
        let record = auth::require(layout)?;
        let client = catalog::Catalog::new(Some(record.token.clone()))?;
        if let Some(b) = a.subcommand_matches("sync") {
            let daemon = secretd::Daemon::local()?;
            if b.is_present("dry-run") {
                let entries = secrets::plan(&client, &daemon, &record.user_id, b.is_present("force"))?;
                for e in entries {
                    print!(
                        "{}\t{}\tremote v{}\tlocal {}\n",
                        e.action,
                        e.name,
                        e.remote_version,
                        e.local_version.map(|v| format!("v{}", v)).unwrap_or_else(|| "-".into())
                    );
                }
                return Ok(());
            }
            let outcome = secrets::sync(&client, &daemon, &record.user_id, b.is_present("force"))?;
            print!(
                "synced {} / skipped {} / errored {}\n",
                outcome.synced, outcome.skipped, outcome.errored
            );
            return Ok(());
        }
        if a.subcommand_matches("list").is_some() {
            for meta in client.secrets_list()? {
                print!("{}\tv{}\n", meta.name, meta.version);
            }
            return Ok(());
        }
        if let Some(b) = a.subcommand_matches("get") {
            let sv = client.secret_get(b.value_of("name").unwrap())?;
            print!("{}\n", sv.value);
            return Ok(());
        }
        if let Some(b) = a.subcommand_matches("set") {
            let res = client.secret_set(b.value_of("name").unwrap(), b.value_of("value").unwrap())?;
            print!("{} now at v{}\n", res.name, res.version);
            return Ok(());
        }
        if let Some(b) = a.subcommand_matches("delete") {
            let res = client.secret_delete(b.value_of("name").unwrap())?;
            print!("deleted {}\n", res.name);
            return Ok(());
        }
    }
    if args.subcommand_matches("versions").is_some() {
        let record = auth::require(layout)?;
        let client = catalog::Catalog::new(Some(record.token))?;
        for v in client.versions(&record.user_id)? {
            print!("{}\n", v);
        }
        return Ok(());
    }
    if let Some(a) = args.subcommand_matches("login") {
        let client = catalog::Catalog::new(None)?;
        let claims = serde_json::json!({ "identity_token": a.value_of("identity").unwrap() });
        let grant = client.login(claims)?;
        let record = auth::AuthRecord {
            token: grant.token,
            token_type: grant.token_type,
            user_id: grant.user_id,
            user_email: grant.user_email,
            expires_at: grant.expires_at,
        };
        auth::save(layout, &record)?;
        print!("logged in as {} ({})\n", record.user_email, record.user_id);
        return Ok(());
    }
    if args.subcommand_matches("logout").is_some() {
        return auth::clear(layout);
    }
    if args.subcommand_matches("whoami").is_some() {
        match identity(layout)? {
            Some(r) => {
                print!("{} ({})\n", r.user_email, r.user_id);
                if let Some(exp) = r.expires_at {
                    print!("token expiry hint: {}\n", exp.to_rfc3339());
                }
            }
            None => print!("not logged in\n"),
        }
        return Ok(());
    }
    if args.subcommand_matches("doctor").is_some() {
        return doctor(layout);
    }

    unreachable!("Subcommand valid, but not implemented");
}

/// Environment sanity checks
fn doctor(layout: &Layout) -> Result<()> {
    for tool in &["podman", "systemctl", "git"] {
        match which::which(tool) {
            Ok(p) => print!("ok\t{} at {}\n", tool, p.display()),
            Err(_) => print!("MISSING\t{}\n", tool),
        }
    }
    match secretd::Daemon::local() {
        Ok(d) => match d.health() {
            Ok(()) => print!("ok\tsecret daemon\n"),
            Err(_) => print!("DOWN\tsecret daemon\n"),
        },
        Err(_) => print!("DOWN\tsecret daemon\n"),
    }
    let cat = catalog_client(layout)?;
    if cat.healthy() {
        print!("ok\tcatalog {}\n", paths::catalog_base());
    } else {
        print!("DOWN\tcatalog {}\n", paths::catalog_base());
    }
    match identity(layout)? {
        Some(ref r) if r.is_valid() => print!("ok\tlogged in as {}\n", r.user_email),
        _ => print!("-\tnot logged in\n"),
    }
    Ok(())
}
