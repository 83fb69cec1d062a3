mod client;
mod config;

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use client::{Reply, RequestKind, Tickets, TranspositionClient};
use config::Config;
use crossbeam::channel::{Receiver, Sender, unbounded};
use eframe::egui;
use stemsync_core::{
    AnalysisManifest, ChangeRequest, ClockBackend, EngineBackend, MusicalKey, Player,
    ResetRequest, SinkBackend, StemName, WaveformTrace, bpm_delta, lyrics,
};

const WAVEFORM_HEIGHT: f32 = 120.0;

fn main() -> eframe::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    let config = Config::load();
    let manifest_path = std::env::args().nth(1).map(PathBuf::from);

    let options = eframe::NativeOptions {
        viewport: egui::ViewportBuilder::default().with_inner_size([960.0, 640.0]),
        ..Default::default()
    };

    eframe::run_native(
        "stemsync",
        options,
        Box::new(move |_cc| {
            let bucket_frames = config.player.waveform_bucket_frames;
            let app: Box<dyn eframe::App> = if config.headless {
                log::info!("headless mode, playback is silent");
                Box::new(StemApp::new(
                    ClockBackend::decoding(bucket_frames),
                    config,
                    manifest_path,
                ))
            } else {
                match EngineBackend::with_bucket_frames(bucket_frames) {
                    Ok(engine) => Box::new(StemApp::new(engine, config, manifest_path)),
                    Err(e) => {
                        log::warn!("audio output unavailable ({e:#}), playback is silent");
                        Box::new(StemApp::new(
                            ClockBackend::decoding(bucket_frames),
                            config,
                            manifest_path,
                        ))
                    }
                }
            };
            Ok(app)
        }),
    )
}

/// Backends that need the UI loop to move time forward.
trait Tick {
    fn tick(&mut self, _dt: f64) {}
}

impl Tick for EngineBackend {}

impl Tick for ClockBackend {
    fn tick(&mut self, dt: f64) {
        self.advance(dt);
    }
}

struct StemApp<B: SinkBackend> {
    player: Player<B>,
    config: Config,
    client: Option<TranspositionClient>,
    replies_tx: Sender<Reply>,
    replies_rx: Receiver<Reply>,
    manifest: Option<AnalysisManifest>,
    lyrics: Vec<String>,
    bpm_text: String,
    tickets: Tickets,
    in_flight: usize,
    error_message: Option<String>,
    last_frame: Instant,
}

impl<B: SinkBackend + Tick> StemApp<B> {
    fn new(backend: B, config: Config, manifest_path: Option<PathBuf>) -> Self {
        let client = match TranspositionClient::new(config.backend_url.clone()) {
            Ok(client) => Some(client),
            Err(e) => {
                log::warn!("key and tempo changes disabled: {e:#}");
                None
            }
        };
        let (replies_tx, replies_rx) = unbounded();

        let mut app = Self {
            player: Player::new(backend, config.player.clone()),
            config,
            client,
            replies_tx,
            replies_rx,
            manifest: None,
            lyrics: Vec::new(),
            bpm_text: String::new(),
            tickets: Tickets::default(),
            in_flight: 0,
            error_message: None,
            last_frame: Instant::now(),
        };
        if let Some(path) = manifest_path {
            app.open_manifest(&path);
        }
        app
    }

    fn open_dialog(&mut self) {
        let mut dialog = rfd::FileDialog::new().add_filter("Analysis", &["json"]);
        if let Some(dir) = &self.config.last_directory {
            dialog = dialog.set_directory(dir);
        }
        if let Some(path) = dialog.pick_file() {
            self.config.last_directory = path.parent().map(Path::to_path_buf);
            self.config.save();
            self.open_manifest(&path);
        }
    }

    fn open_manifest(&mut self, path: &Path) {
        match AnalysisManifest::load(path) {
            Ok(manifest) => {
                self.tickets.invalidate(&manifest.id);
                self.player.load_analysis(&manifest);
                self.lyrics = lyrics::lines(&manifest.lyrics);
                self.sync_bpm_text();
                self.manifest = Some(manifest);
                self.error_message = None;
            }
            Err(e) => {
                log::error!("{e:#}");
                self.error_message = Some(format!("Failed to open: {e:#}"));
            }
        }
    }

    fn sync_bpm_text(&mut self) {
        self.bpm_text = self
            .player
            .song()
            .and_then(|s| s.bpm)
            .map(|b| format!("{:.0}", b.trunc()))
            .unwrap_or_default();
    }

    fn change_request(&self, value: i32) -> Option<ChangeRequest> {
        let manifest = self.manifest.as_ref()?;
        let song = self.player.song()?;
        Some(ChangeRequest {
            value,
            current_key: song.key.map(|k| k.to_string()).unwrap_or_default(),
            current_bpm: song.bpm.map(|b| b.trunc() as i64).unwrap_or_default(),
            song_id: manifest.id.clone(),
            current_audio_stems: self.player.stem_set().clone(),
        })
    }

    fn request_change(&mut self, kind: RequestKind, value: i32) {
        let (Some(client), Some(request)) = (&self.client, self.change_request(value)) else {
            return;
        };
        log::info!("requesting {kind:?} change of {value}");
        client.spawn_change(kind, request, self.tickets.issue(), self.replies_tx.clone());
        self.in_flight += 1;
    }

    fn reset(&mut self) {
        self.player.reset();
        self.sync_bpm_text();
        if let Some(manifest) = &self.manifest {
            self.tickets.invalidate(&manifest.id);
        }
        if let (Some(client), Some(manifest)) = (&self.client, &self.manifest) {
            client.spawn_reset(
                ResetRequest {
                    song_id: manifest.id.clone(),
                },
                self.tickets.issue(),
                self.replies_tx.clone(),
            );
            self.in_flight += 1;
        }
    }

    fn poll_replies(&mut self) {
        while let Ok(reply) = self.replies_rx.try_recv() {
            self.in_flight = self.in_flight.saturating_sub(1);
            if !self.tickets.is_current(&reply.ticket) {
                log::debug!("dropping {:?} reply issued before the last open or reset", reply.kind);
                continue;
            }
            let response = match reply.result {
                Ok(response) => response,
                Err(e) => {
                    log::error!("{:?} change failed: {e:#}", reply.kind);
                    self.error_message = Some(format!("{:?} change failed: {e:#}", reply.kind));
                    continue;
                }
            };

            // Reset already swapped back locally; the service only cleans up
            if reply.kind == RequestKind::Reset {
                log::debug!("service reset acknowledged");
                continue;
            }

            let Some(client) = &self.client else {
                continue;
            };
            match response.stem_set(client.base_url()) {
                Ok(stem_set) => {
                    self.player.on_key_change(stem_set, response.key_change());
                    self.sync_bpm_text();
                    self.error_message = None;
                }
                Err(e) => {
                    log::warn!("unusable {:?} response: {e}", reply.kind);
                    self.error_message = Some(format!("Unusable response: {e}"));
                }
            }
        }
    }

    fn header_ui(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            let idle = self.in_flight == 0;
            if ui
                .add_enabled(idle, egui::Button::new("Open analysis…"))
                .clicked()
            {
                self.open_dialog();
            }
            if let Some(manifest) = &self.manifest {
                ui.heading(if manifest.title.is_empty() {
                    &manifest.id
                } else {
                    &manifest.title
                });
                if !manifest.artist.is_empty() {
                    ui.label(format!("by {}", manifest.artist));
                }
            }
            if self.player.is_loading() || self.in_flight > 0 {
                ui.spinner();
            }
        });
    }

    fn key_bpm_ui(&mut self, ui: &mut egui::Ui) {
        let Some(song) = self.player.song().cloned() else {
            return;
        };
        let enabled = self.client.is_some() && self.in_flight == 0;

        ui.horizontal(|ui| {
            ui.add_enabled_ui(enabled && song.key.is_some(), |ui| {
                ui.label("Key");
                if ui.button("-").clicked() {
                    self.request_change(RequestKind::Key, -1);
                }
                let current = song.key.map(|k| k.to_string()).unwrap_or_else(|| "?".into());
                let mut target: Option<MusicalKey> = None;
                egui::ComboBox::from_id_salt("key_rotation")
                    .selected_text(current)
                    .width(60.0)
                    .show_ui(ui, |ui| {
                        for key in song.key.map(MusicalKey::rotation).unwrap_or_default() {
                            if ui.selectable_label(false, key.to_string()).clicked() {
                                target = Some(key);
                            }
                        }
                    });
                if ui.button("+").clicked() {
                    self.request_change(RequestKind::Key, 1);
                }
                if let (Some(current), Some(target)) = (song.key, target) {
                    self.request_change(RequestKind::Key, current.shift_to(target));
                }
            });

            ui.add_space(20.0);

            if song.is_modified()
                && ui
                    .add_enabled(self.in_flight == 0, egui::Button::new("Reset"))
                    .clicked()
            {
                self.reset();
            }

            ui.add_space(20.0);

            ui.add_enabled_ui(enabled && song.bpm.is_some(), |ui| {
                ui.label("BPM");
                if ui.button("-").clicked() {
                    self.request_change(RequestKind::Bpm, -1);
                }
                let response =
                    ui.add(egui::TextEdit::singleline(&mut self.bpm_text).desired_width(50.0));
                if response.lost_focus() {
                    match song.bpm.and_then(|bpm| bpm_delta(&self.bpm_text, bpm)) {
                        Some(delta) => self.request_change(RequestKind::Bpm, delta),
                        None => self.sync_bpm_text(),
                    }
                }
                if ui.button("+").clicked() {
                    self.request_change(RequestKind::Bpm, 1);
                }
            });
        });
    }

    fn waveform_ui(&mut self, ui: &mut egui::Ui) {
        let width = ui.available_width().max(1.0);
        let (rect, response) = ui.allocate_exact_size(
            egui::vec2(width, WAVEFORM_HEIGHT),
            egui::Sense::click_and_drag(),
        );
        let painter = ui.painter_at(rect);
        painter.rect_filled(rect, 4.0, egui::Color32::from_rgb(30, 30, 36));

        let placeholder = matches!(
            self.player.waveform().trace(self.player.transport()),
            WaveformTrace::Placeholder
        );
        let color = if placeholder {
            egui::Color32::from_rgb(70, 70, 70)
        } else {
            egui::Color32::from_rgb(100, 180, 100)
        };

        let mid = rect.center().y;
        let half = rect.height() / 2.0 - 2.0;
        let columns = self.player.waveform_columns(rect.width() as usize);
        for (i, (min, max)) in columns.iter().enumerate() {
            let x = rect.left() + i as f32 + 0.5;
            let top = mid - max.clamp(-1.0, 1.0) * half;
            let bottom = mid - min.clamp(-1.0, 1.0) * half;
            painter.line_segment(
                [egui::pos2(x, top), egui::pos2(x, bottom.max(top + 1.0))],
                egui::Stroke::new(1.0, color),
            );
        }

        let fraction = self.player.waveform().cursor_fraction(self.player.transport()) as f32;
        let cursor_x = rect.left() + fraction * rect.width();
        painter.line_segment(
            [egui::pos2(cursor_x, rect.top()), egui::pos2(cursor_x, rect.bottom())],
            egui::Stroke::new(2.0, egui::Color32::YELLOW),
        );

        if response.clicked() || response.dragged() {
            if let Some(pos) = response.interact_pointer_pos() {
                let fraction = ((pos.x - rect.left()) / rect.width()).clamp(0.0, 1.0);
                self.player.scrub(fraction as f64);
            }
        }
    }

    fn transport_ui(&mut self, ui: &mut egui::Ui) {
        let state = self.player.state();
        ui.horizontal(|ui| {
            let label = if state.is_playing { "⏸ Pause" } else { "▶ Play" };
            if ui.button(label).clicked() {
                if let Err(e) = self.player.toggle() {
                    self.error_message = Some(format!("Playback failed: {e}"));
                }
            }

            let mut position = state.position_secs;
            let slider = egui::Slider::new(&mut position, 0.0..=state.duration_secs.max(0.0))
                .show_value(false);
            if ui.add_enabled(state.duration_secs > 0.0, slider).changed() {
                self.player.seek(position);
            }

            ui.monospace(self.player.readout());

            let selected = self.player.waveform().selected();
            egui::ComboBox::from_id_salt("waveform_stem")
                .selected_text(selected.label())
                .show_ui(ui, |ui| {
                    for stem in StemName::ALL {
                        if ui.selectable_label(stem == selected, stem.label()).clicked() {
                            self.player.select_stem(stem);
                        }
                    }
                });
        });

        if let Some(spread) = self.player.transport().duration_mismatch() {
            ui.colored_label(
                egui::Color32::LIGHT_RED,
                format!("Stem lengths differ by {spread:.2}s"),
            );
        }
    }

    fn mixer_ui(&mut self, ui: &mut egui::Ui) {
        ui.horizontal(|ui| {
            for stem in StemName::ALL {
                let live = self.player.transport().sink(stem).is_some();
                let mut volume = self.player.mixer().volume(stem);
                ui.vertical(|ui| {
                    ui.add_enabled(live, egui::Label::new(stem.label()));
                    let slider = egui::Slider::new(&mut volume, 0.0..=1.0).vertical();
                    if ui.add(slider).changed() {
                        if let Err(e) = self.player.on_volume_change(stem, volume) {
                            log::warn!("{e}");
                        }
                    }
                });
            }
        });
    }
}

impl<B: SinkBackend + Tick> eframe::App for StemApp<B> {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        let now = Instant::now();
        let dt = now.duration_since(self.last_frame).as_secs_f64();
        self.last_frame = now;

        self.player.backend_mut().tick(dt);
        self.player.pump();
        self.poll_replies();

        if self.player.state().is_playing || self.player.is_loading() || self.in_flight > 0 {
            ctx.request_repaint_after(Duration::from_millis(30));
        }

        if !self.lyrics.is_empty() {
            egui::SidePanel::right("lyrics")
                .resizable(true)
                .default_width(260.0)
                .show(ctx, |ui| {
                    ui.heading("Lyrics");
                    egui::ScrollArea::vertical().show(ui, |ui| {
                        for line in &self.lyrics {
                            ui.label(line);
                        }
                    });
                });
        }

        egui::CentralPanel::default().show(ctx, |ui| {
            self.header_ui(ui);

            if let Some(error) = &self.error_message {
                ui.colored_label(egui::Color32::RED, error);
            }

            ui.separator();
            self.key_bpm_ui(ui);
            ui.separator();
            self.waveform_ui(ui);
            self.transport_ui(ui);
            ui.separator();
            self.mixer_ui(ui);
        });
    }
}
