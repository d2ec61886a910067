//! DevProxy Desktop: egui app state and UI.
//!
//! The panel never serves requests itself. It edits the config file and supervises a
//! `devproxy serve` child process.

use devproxy_core::config::{self, Config};
use eframe::egui;
use std::collections::VecDeque;
use std::io::BufRead;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::process::{Child, ExitStatus, Stdio};
use std::sync::mpsc;
use std::sync::{Mutex, OnceLock};
use std::time::{Duration, Instant};

const LOG_BUFFER_MAX_LINES: usize = 2000;

/// Frames between gateway probes (probe at ~1 Hz if 60 fps).
const PROBE_INTERVAL_FRAMES: u32 = 60;

/// How long a stopping gateway gets to drain requests and write `service_stop`.
const GATEWAY_STOP_GRACE: Duration = Duration::from_secs(5);

/// Ring buffer of log lines for the Logs screen. Written by DesktopLogger and the gateway output readers.
static LOG_LINES: OnceLock<Mutex<VecDeque<String>>> = OnceLock::new();

fn log_buffer() -> &'static Mutex<VecDeque<String>> {
    LOG_LINES.get_or_init(|| Mutex::new(VecDeque::new()))
}

fn push_log_line(line: String) {
    if let Ok(mut buf) = log_buffer().lock() {
        buf.push_back(line);
        while buf.len() > LOG_BUFFER_MAX_LINES {
            buf.pop_front();
        }
    }
}

/// Logger that appends to LOG_LINES for display in the Logs screen.
struct DesktopLogger;

impl log::Log for DesktopLogger {
    fn enabled(&self, _: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        let line = format!(
            "{} [{}] {}",
            clock_time(),
            record.level(),
            record.args()
        );
        push_log_line(line);
    }

    fn flush(&self) {}
}

/// HH:MM:SS.mmm (UTC) for log lines.
fn clock_time() -> String {
    let t = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    let secs = t.as_secs();
    format!(
        "{:02}:{:02}:{:02}.{:03}",
        (secs / 3600) % 24,
        (secs / 60) % 60,
        secs % 60,
        t.subsec_millis()
    )
}

static LOGGER: DesktopLogger = DesktopLogger;

/// Resolve the devproxy CLI binary: same directory as this executable, or "devproxy" from PATH.
fn resolve_devproxy_binary() -> PathBuf {
    let name = if cfg!(windows) { "devproxy.exe" } else { "devproxy" };
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(name)))
        .filter(|candidate| candidate.exists())
        .unwrap_or_else(|| PathBuf::from("devproxy"))
}

/// Loopback-reachable address for a gateway configured with `config`.
fn probe_addr(config: &Config) -> Option<SocketAddr> {
    let ip = match config.bind.trim() {
        "" | "0.0.0.0" | "localhost" => IpAddr::V4(Ipv4Addr::LOCALHOST),
        "::" => IpAddr::V6(Ipv6Addr::LOCALHOST),
        other => other.trim_matches(|c| c == '[' || c == ']').parse().ok()?,
    };
    Some(SocketAddr::new(ip, config.port))
}

fn list_to_lines(items: &[String]) -> String {
    items.join("\n")
}

/// One entry per non-empty line, trimmed.
fn lines_to_list(text: &str) -> Vec<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Clone, Copy, PartialEq, Eq, Default)]
enum Screen {
    #[default]
    Settings,
    Logs,
}

/// Editable copy of the config fields shown on the Settings screen.
#[derive(Clone, Default)]
struct SettingsForm {
    port: String,
    token: String,
    commands: String,
    paths: String,
    banned: String,
}

impl SettingsForm {
    fn from_config(config: &Config) -> Self {
        Self {
            port: config.port.to_string(),
            token: config.api_token.clone(),
            commands: list_to_lines(&config.allowed_commands),
            paths: list_to_lines(&config.allowed_paths),
            banned: list_to_lines(&config.banned_keywords),
        }
    }

    /// Merge the form into `base`; fields the panel does not show are kept.
    fn apply(&self, base: &Config) -> anyhow::Result<Config> {
        let port: u16 = self
            .port
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("port must be a number between 1 and 65535"))?;
        if self.token.trim().is_empty() {
            anyhow::bail!("admin token must not be empty");
        }
        let config = Config {
            port,
            api_token: self.token.trim().to_string(),
            allowed_commands: lines_to_list(&self.commands),
            allowed_paths: lines_to_list(&self.paths),
            banned_keywords: lines_to_list(&self.banned),
            ..base.clone()
        };
        config.validate()?;
        Ok(config)
    }
}

pub struct DevProxyApp {
    /// Config file edited by the panel and passed to `devproxy serve --config`.
    config_path: PathBuf,
    /// Last loaded or saved config; the form is merged into it on save.
    config: Config,
    form: SettingsForm,
    show_token: bool,
    /// Result of the last save/load, shown under the Save button.
    settings_message: Option<String>,
    /// When Some, the gateway subprocess is running. Cleared when process exits or we stop it.
    gateway_process: Option<Child>,
    /// Last error from start gateway (e.g. spawn failed).
    gateway_error: Option<String>,
    /// True if the configured port accepted a TCP connection (we or someone else).
    gateway_responds: bool,
    /// True once we have received at least one probe result.
    gateway_probe_completed: bool,
    probe_receiver: Option<mpsc::Receiver<bool>>,
    frames_since_probe: u32,
    current_screen: Screen,
}

impl DevProxyApp {
    /// Space between the main screen title and the content below.
    const SCREEN_TITLE_BOTTOM_SPACING: f32 = 18.0;
    /// Space between the bottom of the content and the window edge.
    const SCREEN_FOOTER_SPACING: f32 = 48.0;

    pub fn new(_cc: &eframe::CreationContext<'_>) -> Self {
        let _ = LOG_LINES.get_or_init(|| Mutex::new(VecDeque::new()));
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Debug);
        log::info!("desktop started");

        let config_path = config::default_config_path();
        let (config, settings_message) = match devproxy_core::init::load_or_init(&config_path) {
            Ok((config, created)) => {
                let msg = created.then(|| format!("Created {}", config_path.display()));
                (config, msg)
            }
            Err(e) => {
                log::error!("loading config: {:#}", e);
                (Config::default(), Some(format!("Failed to load config: {:#}", e)))
            }
        };
        Self {
            form: SettingsForm::from_config(&config),
            config,
            config_path,
            show_token: false,
            settings_message,
            gateway_process: None,
            gateway_error: None,
            gateway_responds: false,
            gateway_probe_completed: false,
            probe_receiver: None,
            frames_since_probe: PROBE_INTERVAL_FRAMES,
            current_screen: Screen::default(),
        }
    }

    /// Poll for probe result and optionally start a new probe. Call each frame.
    fn poll_gateway_probe(&mut self) {
        if let Some(rx) = &self.probe_receiver {
            if let Ok(ok) = rx.try_recv() {
                self.gateway_probe_completed = true;
                self.gateway_responds = ok;
                self.probe_receiver = None;
            }
        }
        self.frames_since_probe = self.frames_since_probe.saturating_add(1);
        if self.probe_receiver.is_none() && self.frames_since_probe >= PROBE_INTERVAL_FRAMES {
            self.frames_since_probe = 0;
            let addr = probe_addr(&self.config);
            let (tx, rx) = mpsc::channel();
            std::thread::spawn(move || {
                let ok = addr
                    .and_then(|addr| {
                        std::net::TcpStream::connect_timeout(&addr, Duration::from_millis(800)).ok()
                    })
                    .is_some();
                let _ = tx.send(ok);
            });
            self.probe_receiver = Some(rx);
        }
    }

    /// True if we started the gateway and it is still running (we can stop it).
    fn gateway_owned(&mut self) -> bool {
        if let Some(ref mut child) = self.gateway_process {
            match child.try_wait() {
                Ok(Some(status)) => {
                    log::warn!("gateway exited: {}", status);
                    self.gateway_process = None;
                    false
                }
                _ => true,
            }
        } else {
            false
        }
    }

    fn start_gateway(&mut self) {
        self.gateway_error = None;
        let binary = resolve_devproxy_binary();
        let child = std::process::Command::new(&binary)
            .arg("serve")
            .arg("--config")
            .arg(&self.config_path)
            .arg("--stop-on-stdin-eof")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn();
        match child {
            Ok(mut c) => {
                if let Some(stderr) = c.stderr.take() {
                    forward_lines(stderr);
                }
                if let Some(stdout) = c.stdout.take() {
                    forward_lines(stdout);
                }
                log::info!("started gateway (pid {})", c.id());
                self.gateway_process = Some(c);
                self.frames_since_probe = PROBE_INTERVAL_FRAMES;
            }
            Err(e) => {
                self.gateway_error = Some(format!("failed to start {}: {}", binary.display(), e));
            }
        }
    }

    fn stop_gateway(&mut self) {
        if let Some(mut child) = self.gateway_process.take() {
            match stop_child(&mut child, GATEWAY_STOP_GRACE) {
                Ok(status) => log::info!("gateway stopped ({})", status),
                Err(e) => log::warn!("stopping gateway: {}", e),
            }
        }
        self.gateway_responds = false;
        self.gateway_error = None;
        self.frames_since_probe = PROBE_INTERVAL_FRAMES;
    }

    fn restart_gateway(&mut self) {
        self.stop_gateway();
        self.start_gateway();
    }

    fn save_settings(&mut self) {
        let result = self
            .form
            .apply(&self.config)
            .and_then(|config| config::save_config(&config, &self.config_path).map(|_| config));
        match result {
            Ok(config) => {
                log::info!("saved settings to {}", self.config_path.display());
                self.config = config;
                self.settings_message = Some(if self.gateway_process.is_some() || self.gateway_responds {
                    "Saved. Restart the gateway to apply.".to_string()
                } else {
                    "Saved.".to_string()
                });
            }
            Err(e) => {
                self.settings_message = Some(format!("Not saved: {:#}", e));
            }
        }
    }

    fn regenerate_token(&mut self) {
        match devproxy_core::init::generate_token() {
            Ok(token) => {
                self.form.token = token;
                self.settings_message = Some("New token generated; Save to keep it.".to_string());
            }
            Err(e) => self.settings_message = Some(format!("Token generation failed: {:#}", e)),
        }
    }

    fn ui_settings_screen(&mut self, ui: &mut egui::Ui) {
        ui.add_space(24.0);
        ui.heading("Settings");
        ui.add_space(Self::SCREEN_TITLE_BOTTOM_SPACING);
        ui.label(format!("Config file: {}", self.config_path.display()));
        ui.add_space(12.0);

        egui::Grid::new("settings_grid")
            .num_columns(2)
            .spacing([16.0, 10.0])
            .show(ui, |ui| {
                ui.label("Port");
                ui.add(egui::TextEdit::singleline(&mut self.form.port).desired_width(80.0));
                ui.end_row();

                ui.label("Admin token");
                ui.horizontal(|ui| {
                    ui.add(
                        egui::TextEdit::singleline(&mut self.form.token)
                            .password(!self.show_token)
                            .desired_width(360.0)
                            .font(egui::TextStyle::Monospace),
                    );
                    let toggle = if self.show_token { "Hide" } else { "Show" };
                    if ui.button(toggle).clicked() {
                        self.show_token = !self.show_token;
                    }
                    if ui.button("Copy").clicked() {
                        copy_to_clipboard(ui.ctx(), &self.form.token);
                        self.settings_message = Some("Token copied to clipboard.".to_string());
                    }
                    if ui.button("Regenerate").clicked() {
                        self.regenerate_token();
                    }
                });
                ui.end_row();
            });

        ui.add_space(16.0);
        ui.columns(3, |cols| {
            list_editor(&mut cols[0], "Allowed commands", &mut self.form.commands);
            list_editor(&mut cols[1], "Allowed paths", &mut self.form.paths);
            list_editor(&mut cols[2], "Banned keywords", &mut self.form.banned);
        });

        ui.add_space(16.0);
        ui.horizontal(|ui| {
            if ui.button("Save").clicked() {
                self.save_settings();
            }
            if ui.button("Revert").clicked() {
                self.form = SettingsForm::from_config(&self.config);
                self.settings_message = None;
            }
        });
        if let Some(ref msg) = self.settings_message {
            ui.add_space(8.0);
            ui.label(msg.as_str());
        }
        ui.add_space(Self::SCREEN_FOOTER_SPACING);
    }

    fn ui_logs_screen(&self, ui: &mut egui::Ui) {
        ui.add_space(24.0);
        ui.heading("Logs");
        ui.add_space(Self::SCREEN_TITLE_BOTTOM_SPACING);

        let lines: Vec<String> = log_buffer()
            .lock()
            .map(|b| b.iter().cloned().collect())
            .unwrap_or_default();

        let available = ui.available_height();
        let scroll_height = (available - Self::SCREEN_FOOTER_SPACING).max(0.0);
        egui::ScrollArea::vertical()
            .max_height(scroll_height)
            .stick_to_bottom(true)
            .show(ui, |ui| {
                for line in &lines {
                    ui.label(
                        egui::RichText::new(line.as_str()).family(egui::FontFamily::Monospace),
                    );
                }
                if lines.is_empty() {
                    ui.label("No log output yet.");
                }
            });
        ui.add_space(Self::SCREEN_FOOTER_SPACING);
    }
}

/// Ask the child to exit and kill it if it is still running after `grace`. Closing stdin
/// works everywhere; Unix also gets SIGTERM.
fn stop_child(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    drop(child.stdin.take());
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(child.id()) {
            if let Err(e) = kill(Pid::from_raw(pid), Signal::SIGTERM) {
                log::debug!("SIGTERM {}: {}", pid, e);
            }
        }
    }

    let deadline = Instant::now() + grace;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            break;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    log::warn!("gateway still running after {:?}, killing it", grace);
    if let Err(e) = child.kill() {
        log::debug!("kill: {}", e);
    }
    child.wait()
}

fn copy_to_clipboard(ctx: &egui::Context, text: &str) {
    ctx.output_mut(|o| o.copied_text = text.to_string());
}

/// Copy each line of a child pipe into the Logs buffer.
fn forward_lines<R: std::io::Read + Send + 'static>(pipe: R) {
    std::thread::spawn(move || {
        for line in std::io::BufReader::new(pipe).lines().map_while(Result::ok) {
            push_log_line(format!("[gateway] {}", line));
        }
    });
}

fn list_editor(ui: &mut egui::Ui, label: &str, text: &mut String) {
    ui.label(label);
    ui.add(
        egui::TextEdit::multiline(text)
            .desired_rows(12)
            .desired_width(f32::INFINITY)
            .font(egui::TextStyle::Monospace),
    );
}

impl eframe::App for DevProxyApp {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.poll_gateway_probe();
        let owned = self.gateway_owned();
        let running = owned || self.gateway_responds;

        egui::TopBottomPanel::top("header").show(ctx, |ui| {
            egui::Frame::none()
                .inner_margin(egui::Margin::symmetric(24.0, 0.0))
                .show(ui, |ui| {
                    ui.add_space(16.0);
                    ui.horizontal(|ui| {
                        ui.heading("DevProxy");
                        ui.add_space(12.0);
                        let status = if !self.gateway_probe_completed {
                            "Checking..."
                        } else if running {
                            "Running"
                        } else {
                            "Stopped"
                        };
                        ui.label(format!("Status: {} (port {})", status, self.config.port));
                        ui.with_layout(egui::Layout::right_to_left(egui::Align::Center), |ui| {
                            if owned {
                                if ui.button("Restart").clicked() {
                                    self.restart_gateway();
                                }
                                if ui.button("Stop").clicked() {
                                    self.stop_gateway();
                                }
                            } else if running {
                                ui.add_enabled(false, egui::Button::new("Running elsewhere"));
                            } else {
                                let ready = self.gateway_probe_completed;
                                if ui.add_enabled(ready, egui::Button::new("Start")).clicked() {
                                    self.start_gateway();
                                }
                            }
                        });
                    });
                    if let Some(ref err) = self.gateway_error {
                        ui.colored_label(ui.visuals().error_fg_color, err.as_str());
                    }
                    ui.add_space(16.0);
                });
        });

        let current_screen = &mut self.current_screen;
        egui::SidePanel::left("sidebar")
            .resizable(false)
            .exact_width(140.0)
            .show(ctx, |ui| {
                egui::Frame::none()
                    .inner_margin(egui::Margin::symmetric(24.0, 0.0))
                    .show(ui, |ui| {
                        ui.add_space(24.0);
                        if ui
                            .selectable_label(*current_screen == Screen::Settings, "Settings")
                            .clicked()
                        {
                            *current_screen = Screen::Settings;
                        }
                        ui.add_space(12.0);
                        if ui.selectable_label(*current_screen == Screen::Logs, "Logs").clicked() {
                            *current_screen = Screen::Logs;
                        }
                    });
            });

        egui::CentralPanel::default().show(ctx, |ui| {
            egui::Frame::none()
                .inner_margin(egui::Margin::symmetric(24.0, 0.0))
                .show(ui, |ui| match self.current_screen {
                    Screen::Settings => {
                        egui::ScrollArea::vertical().show(ui, |ui| self.ui_settings_screen(ui));
                    }
                    Screen::Logs => self.ui_logs_screen(ui),
                });
        });

        // Keep probing while idle.
        ctx.request_repaint_after(Duration::from_millis(16));
    }
}

impl Drop for DevProxyApp {
    fn drop(&mut self) {
        self.stop_gateway();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_to_list_drops_blank_lines_and_trims() {
        assert_eq!(
            lines_to_list("go\n\n  cargo  \r\nnpm\n"),
            vec!["go", "cargo", "npm"]
        );
    }

    #[test]
    fn form_round_trips_and_keeps_hidden_fields() {
        let mut base = Config::default();
        base.api_token = "abc".into();
        base.allowed_commands = vec!["go".into(), "cargo".into()];
        base.exec_timeout_secs = Some(30);

        let mut form = SettingsForm::from_config(&base);
        assert_eq!(form.commands, "go\ncargo");
        form.port = " 9000 ".into();
        form.paths = "/srv/dev\n/home/*/src".into();

        let saved = form.apply(&base).unwrap();
        assert_eq!(saved.port, 9000);
        assert_eq!(saved.allowed_paths, vec!["/srv/dev", "/home/*/src"]);
        assert_eq!(saved.exec_timeout_secs, Some(30));
        assert_eq!(saved.api_token, "abc");
    }

    #[test]
    fn form_rejects_bad_port_and_empty_token() {
        let base = Config {
            api_token: "abc".into(),
            ..Config::default()
        };
        let mut form = SettingsForm::from_config(&base);
        form.port = "http".into();
        assert!(form.apply(&base).is_err());

        let mut form = SettingsForm::from_config(&base);
        form.token = "  ".into();
        assert!(form.apply(&base).is_err());
    }

    #[test]
    fn copy_to_clipboard_hands_the_text_to_the_platform() {
        let ctx = egui::Context::default();
        let output = ctx.run(egui::RawInput::default(), |ctx| {
            copy_to_clipboard(ctx, "s3cret-token");
        });
        assert_eq!(output.platform_output.copied_text, "s3cret-token");
    }

    #[cfg(unix)]
    fn spawn_sh(script: &str) -> Child {
        std::process::Command::new("sh")
            .args(["-c", script])
            .stdin(Stdio::piped())
            .spawn()
            .unwrap()
    }

    #[cfg(unix)]
    #[test]
    fn stop_child_lets_the_process_handle_sigterm() {
        let mut child = spawn_sh("trap 'exit 7' TERM; while true; do sleep 0.1; done");
        std::thread::sleep(Duration::from_millis(200));
        let status = stop_child(&mut child, Duration::from_secs(5)).unwrap();
        assert_eq!(status.code(), Some(7));
    }

    #[cfg(unix)]
    #[test]
    fn stop_child_closes_stdin() {
        let mut child = spawn_sh("trap '' TERM; cat >/dev/null; exit 3");
        std::thread::sleep(Duration::from_millis(200));
        let status = stop_child(&mut child, Duration::from_secs(5)).unwrap();
        assert_eq!(status.code(), Some(3));
    }

    #[cfg(unix)]
    #[test]
    fn stop_child_kills_after_the_grace_period() {
        let mut child = spawn_sh("trap '' TERM; exec sleep 30 </dev/null");
        std::thread::sleep(Duration::from_millis(100));
        let start = Instant::now();
        let status = stop_child(&mut child, Duration::from_millis(300)).unwrap();
        assert!(start.elapsed() < Duration::from_secs(5));
        assert!(!status.success());
    }

    #[test]
    fn probe_addr_maps_wildcard_binds_to_loopback() {
        let mut c = Config::default();
        c.port = 2223;
        assert_eq!(probe_addr(&c), Some("127.0.0.1:2223".parse().unwrap()));
        c.bind = "0.0.0.0".into();
        assert_eq!(probe_addr(&c), Some("127.0.0.1:2223".parse().unwrap()));
        c.bind = "::1".into();
        assert_eq!(probe_addr(&c), Some("[::1]:2223".parse().unwrap()));
        c.bind = "not an ip".into();
        assert_eq!(probe_addr(&c), None);
    }
}
