mod app;
mod cli;
mod config;
mod console;
mod error;
mod filter;
mod gcloud;
mod input;
mod model;
mod selection;
mod session;
mod tree;
mod ui;

use anyhow::{Context, Result};
use app::{App, AppCommand};
use clap::Parser;
use cli::CliArgs;
use config::{FileProjectRegistry, ProjectRegistry};
use console::{BrowserConsole, ConsoleLauncher};
use crossterm::event::{
    Event, EventStream, KeyEventKind, KeyboardEnhancementFlags, PopKeyboardEnhancementFlags,
    PushKeyboardEnhancementFlags,
};
use crossterm::execute;
use crossterm::terminal::{
    EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
    supports_keyboard_enhancement,
};
use futures::StreamExt;
use gcloud::GcloudInventory;
use input::Action;
use ratatui::Terminal;
use ratatui::backend::CrosstermBackend;
use session::{ConnectionTracker, SessionBroker, SessionEvent, SessionEventBus, TunnelManager};
use std::io::{self, Stdout};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::time::{Duration, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use tree::{NodeRef, ResourceTree, TreeEvent};

type TuiTerminal = Terminal<CrosstermBackend<Stdout>>;
const CHILD_FETCH_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log_filter)?;

    let settings = config::load_settings(args.config.clone())?;
    if settings.loaded {
        debug!(
            "config {} tracks {} projects",
            settings.path.display(),
            settings.projects.len()
        );
    }

    let registry = Arc::new(FileProjectRegistry::new(settings.path.clone()));
    for project in &args.projects {
        match registry.add(project) {
            Ok(true) => debug!("tracking {project} from the command line"),
            Ok(false) => debug!("{project} is already tracked"),
            Err(error) => warn!("could not track {project}: {error}"),
        }
    }

    let binary = args
        .gcloud_binary
        .clone()
        .or(settings.gcloud_binary.clone())
        .unwrap_or_else(|| "gcloud".to_string());
    let inventory = Arc::new(GcloudInventory::new(&binary));

    let bus = SessionEventBus::new();
    let tunnels = Arc::new(TunnelManager::new(&binary, bus.clone()));
    let tracker = ConnectionTracker::new(Arc::clone(&tunnels) as Arc<dyn SessionBroker>);

    let tree = ResourceTree::new(registry, inventory, tracker.clone());
    tree.set_filter(settings.filter.clone());

    let console_base = args.console_base.clone().or(settings.console_base.clone());
    let console = BrowserConsole::new(console_base);

    let mut app = App::new(settings.filter);
    run(&mut app, &tree, &tracker, &tunnels, &console, &bus).await
}

fn init_tracing(level_filter: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level_filter)
        .or_else(|_| EnvFilter::try_new("info"))
        .context("failed to initialize tracing filter")?;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .with_writer(std::io::sink)
        .try_init();

    Ok(())
}

async fn run(
    app: &mut App,
    tree: &ResourceTree,
    tracker: &ConnectionTracker,
    tunnels: &Arc<TunnelManager>,
    console: &BrowserConsole,
    bus: &SessionEventBus,
) -> Result<()> {
    let (mut terminal, keyboard_enhanced) = init_terminal()?;
    let run_result = run_loop(&mut terminal, app, tree, tracker, tunnels, console, bus).await;
    let restore_result = restore_terminal(&mut terminal, keyboard_enhanced);

    match (run_result, restore_result) {
        (Err(run_error), Err(restore_error)) => Err(anyhow::anyhow!(
            "{run_error:#}\nterminal restore error: {restore_error:#}"
        )),
        (Err(error), _) => Err(error),
        (_, Err(error)) => Err(error),
        (Ok(()), Ok(())) => Ok(()),
    }
}

fn init_terminal() -> Result<(TuiTerminal, bool)> {
    enable_raw_mode().context("failed to enable raw mode")?;
    let mut stdout = io::stdout();
    let keyboard_enhanced = matches!(supports_keyboard_enhancement(), Ok(true));
    if keyboard_enhanced {
        execute!(
            stdout,
            EnterAlternateScreen,
            PushKeyboardEnhancementFlags(
                KeyboardEnhancementFlags::DISAMBIGUATE_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_ALL_KEYS_AS_ESCAPE_CODES
                    | KeyboardEnhancementFlags::REPORT_ALTERNATE_KEYS
                    | KeyboardEnhancementFlags::REPORT_EVENT_TYPES
            )
        )
        .context("failed to enter alternate screen with keyboard enhancement")?;
    } else {
        execute!(stdout, EnterAlternateScreen).context("failed to enter alternate screen")?;
    }
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend).context("failed to create terminal backend")?;
    terminal.clear().context("failed to clear terminal")?;
    Ok((terminal, keyboard_enhanced))
}

fn restore_terminal(terminal: &mut TuiTerminal, keyboard_enhanced: bool) -> Result<()> {
    if keyboard_enhanced {
        execute!(terminal.backend_mut(), PopKeyboardEnhancementFlags)
            .context("failed to pop keyboard enhancement flags")?;
    }
    disable_raw_mode().context("failed to disable raw mode")?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)
        .context("failed to leave alternate screen")?;
    terminal.show_cursor().context("failed to show cursor")?;
    Ok(())
}

async fn run_loop(
    terminal: &mut TuiTerminal,
    app: &mut App,
    tree: &ResourceTree,
    tracker: &ConnectionTracker,
    tunnels: &Arc<TunnelManager>,
    console: &BrowserConsole,
    bus: &SessionEventBus,
) -> Result<()> {
    app.set_status("Loading tracked projects…");
    app.rebuild_rows(tree);
    let bootstrap = app.apply_action(Action::ExpandOrCollapse);
    execute_app_command(app, tree, tunnels, console, bootstrap).await;
    app.rebuild_rows(tree);

    let mut reader = EventStream::new();
    let mut tree_events = tree.subscribe();
    let mut session_events = bus.subscribe();

    loop {
        terminal
            .draw(|frame| ui::render(frame, app))
            .context("failed to render terminal frame")?;

        if !app.running() {
            break;
        }

        tokio::select! {
            maybe_event = reader.next() => {
                match maybe_event {
                    Some(Ok(Event::Key(key))) if key.kind == KeyEventKind::Press => {
                        if let Some(action) = input::map_key(app.mode(), key) {
                            debug!("action={action:?}");
                            let command = app.apply_action(action);
                            terminal
                                .draw(|frame| ui::render(frame, app))
                                .context("failed to render terminal frame")?;
                            execute_app_command(app, tree, tunnels, console, command).await;
                            app.rebuild_rows(tree);
                        }
                    }
                    Some(Ok(Event::Resize(_, _))) => {}
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        app.set_status(format!("terminal event error: {error}"));
                    }
                    None => {
                        app.set_status("terminal event stream closed");
                        break;
                    }
                }
            }
            event = tree_events.recv() => {
                match event {
                    Ok(TreeEvent::ChildrenReset(node)) => {
                        debug!("children reset for {node:?}");
                        app.rebuild_rows(tree);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("dropped {skipped} tree updates, rebuilding rows");
                        app.rebuild_rows(tree);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
            event = session_events.recv() => {
                match event {
                    Ok(event) => {
                        tracker.apply(event.clone());
                        app.set_status(session_status(&event, tunnels.active_count()));
                        app.rebuild_rows(tree);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("dropped {skipped} session events");
                        app.rebuild_rows(tree);
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
        }
    }

    Ok(())
}

async fn execute_app_command(
    app: &mut App,
    tree: &ResourceTree,
    tunnels: &Arc<TunnelManager>,
    console: &BrowserConsole,
    command: AppCommand,
) {
    match command {
        AppCommand::None => {}
        AppCommand::LoadChildren { node } => {
            load_node(app, tree, &node, false).await;
        }
        AppCommand::ApplyRefresh { scope } => {
            tree.apply_refresh(&scope);
            reload_expanded(app, tree).await;
        }
        AppCommand::RefreshAll { reload_projects } => {
            tree.refresh(reload_projects);
            reload_expanded(app, tree).await;
        }
        AppCommand::ApplyFilter => {
            tree.set_filter(app.filter().clone());
        }
        AppCommand::AddProject { id } => match tree.add_project(&id) {
            Ok(true) => {
                app.set_status(format!("Tracking project {id}"));
                load_node(app, tree, &NodeRef::Root, false).await;
            }
            Ok(false) => app.set_status(format!("Project {id} is already tracked")),
            Err(error) => app.set_status(format!("Could not add {id}: {error}")),
        },
        AppCommand::RemoveProject { id } => match tree.remove_project(&id) {
            Ok(()) => {
                app.set_status(format!("Stopped tracking {id}"));
                load_node(app, tree, &NodeRef::Root, false).await;
            }
            Err(error) => app.set_status(format!("Could not unload {id}: {error}")),
        },
        AppCommand::OpenInstanceList { project } => console.open_instance_list(&project),
        AppCommand::OpenInstanceDetails { locator } => console.open_instance_details(&locator),
        AppCommand::ConfigureAccess { project } => console.open_access_config(&project),
        AppCommand::Connect { locator } => match tunnels.connect(&locator).await {
            Ok(pid) => app.set_status(format!("Tunnel started for {} pid={pid}", locator.name)),
            Err(error) => {
                app.set_status(format!("Tunnel failed for {}: {error:#}", locator.name));
            }
        },
        AppCommand::Disconnect { locator } => match tunnels.disconnect(&locator) {
            Ok(()) => app.set_status(format!("Stopping tunnel for {}", locator.name)),
            Err(error) => app.set_status(format!("{error:#}")),
        },
    }
}

/// Fetches children for `target` with a timeout, leaving cached rows on any
/// failure. Quiet when serving an intact cache, so routine expands do not
/// churn the status line.
async fn load_node(app: &mut App, tree: &ResourceTree, target: &NodeRef, force_reload: bool) {
    let Some(node) = tree.find_node(target) else {
        debug!("skipping load for unavailable node {target:?}");
        return;
    };
    let had_cache = tree.cached_children(&node).is_some();
    let cancel = CancellationToken::new();

    match timeout(
        CHILD_FETCH_TIMEOUT,
        tree.children(&node, force_reload, &cancel),
    )
    .await
    {
        Ok(Ok(children)) => {
            if force_reload || !had_cache {
                app.mark_refreshed();
                app.set_status(format!(
                    "Loaded {} ({})",
                    node.display_text(),
                    children.len()
                ));
            }
        }
        Ok(Err(error)) => {
            app.set_status(format!(
                "Load failed for {}: {error} (showing cached data)",
                node.display_text()
            ));
        }
        Err(_) => {
            cancel.cancel();
            app.set_status(format!(
                "Load timed out for {} (showing cached data)",
                node.display_text()
            ));
        }
    }
}

/// Reloads every expanded node that is still reachable, shallowest first so
/// parents repopulate before their children are looked up. Nodes with intact
/// caches resolve without a backend call.
async fn reload_expanded(app: &mut App, tree: &ResourceTree) {
    let mut refs = app.expanded_refs();
    refs.sort_by_key(node_ref_depth);
    for node_ref in refs {
        load_node(app, tree, &node_ref, false).await;
    }
}

fn node_ref_depth(node_ref: &NodeRef) -> u8 {
    match node_ref {
        NodeRef::Root => 0,
        NodeRef::Project(_) => 1,
        NodeRef::Zone(_) => 2,
        NodeRef::Instance(_) => 3,
    }
}

fn session_status(event: &SessionEvent, active: usize) -> String {
    match event {
        SessionEvent::Started(locator) => {
            format!("Tunnel up for {} ({active} active)", locator.name)
        }
        SessionEvent::Ended(locator) => {
            format!("Tunnel closed for {} ({active} active)", locator.name)
        }
    }
}
