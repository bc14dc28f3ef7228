// SPDX-License-Identifier: GPL-3.0-only

//! Terminal monitor
//!
//! Renders composites (frame plus detection boxes) to the terminal using
//! Unicode half-block characters for improved vertical resolution, with a
//! status bar showing pipeline state, frame rate and the top detection.

use crate::config::Config;
use crate::pipeline::compositor::Composite;
use crate::pipeline::controller::PipelineController;
use crate::pipeline::render::LatestComposite;
use crate::pipeline::state::PipelineState;
use crate::storage;

use crossterm::{
    event::{self, Event, KeyCode, KeyEventKind, KeyModifiers},
    execute,
    terminal::{EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode},
};
use image::RgbaImage;
use ratatui::{
    Terminal, backend::CrosstermBackend, buffer::Buffer, layout::Rect, style::Color,
    widgets::Widget,
};
use std::io::{self, stdout};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

/// Run the terminal monitor until the user quits
pub fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let runtime = tokio::runtime::Runtime::new()?;
    let surface = Arc::new(LatestComposite::new());
    let mut controller = PipelineController::from_config(&config, surface.clone())?;

    {
        let _guard = runtime.enter();
        controller.start()?;
    }

    // Set up terminal
    enable_raw_mode()?;
    let mut stdout = stdout();
    execute!(stdout, EnterAlternateScreen)?;
    let backend = CrosstermBackend::new(stdout);
    let mut terminal = Terminal::new(backend)?;

    let result = run_app(&mut terminal, &runtime, &mut controller, &surface);

    // Restore terminal
    disable_raw_mode()?;
    execute!(terminal.backend_mut(), LeaveAlternateScreen)?;
    terminal.show_cursor()?;

    runtime.block_on(controller.stop())?;
    result
}

fn run_app(
    terminal: &mut Terminal<CrosstermBackend<io::Stdout>>,
    runtime: &tokio::runtime::Runtime,
    controller: &mut PipelineController,
    surface: &LatestComposite,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut frame_widget = FrameWidget::new();
    let mut latest: Option<Arc<Composite>> = None;
    let mut show_help = false;
    let mut message: Option<String> = None;

    loop {
        // Only re-render the image when a new composite arrived
        if let Some(composite) = surface.take_new() {
            frame_widget.update(composite.render());
            latest = Some(composite);
        }

        let status_line = if show_help {
            help_message(controller.state())
        } else {
            status_message(controller, message.as_deref())
        };

        terminal.draw(|f| {
            let area = f.area();

            // Reserve bottom line for status
            let frame_area = Rect {
                x: area.x,
                y: area.y,
                width: area.width,
                height: area.height.saturating_sub(1),
            };
            f.render_widget(&frame_widget, frame_area);

            let status_area = Rect {
                x: area.x,
                y: area.height.saturating_sub(1),
                width: area.width,
                height: 1,
            };
            f.render_widget(
                StatusBar {
                    message: &status_line,
                    state: controller.state(),
                },
                status_area,
            );
        })?;

        // Handle input with timeout for frame updates
        if event::poll(Duration::from_millis(16))?
            && let Event::Key(key) = event::read()?
            && key.kind == KeyEventKind::Press
        {
            match key.code {
                KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => break,
                KeyCode::Char('q') => break,
                KeyCode::Char('s') => {
                    show_help = false;
                    if let Some(composite) = &latest {
                        message = Some(match save(composite) {
                            Ok(path) => format!("Saved: {}", path.display()),
                            Err(e) => {
                                error!("Failed to save snapshot: {}", e);
                                format!("Error: {}", e)
                            }
                        });
                    }
                }
                KeyCode::Char('r') if !controller.state().is_active() => {
                    show_help = false;
                    let _guard = runtime.enter();
                    message = Some(match controller.start() {
                        Ok(()) => {
                            frame_widget = FrameWidget::new();
                            latest = None;
                            "Restarted".to_string()
                        }
                        Err(e) => {
                            error!("Failed to restart pipeline: {}", e);
                            format!("Error: {}", e)
                        }
                    });
                }
                KeyCode::Char('h') => show_help = !show_help,
                _ => {}
            }
        }
    }

    info!("Terminal monitor exiting");
    Ok(())
}

fn save(composite: &Composite) -> io::Result<PathBuf> {
    let path = storage::timestamped_path(&storage::default_snapshot_dir());
    storage::save_snapshot(composite, &path)?;
    Ok(path)
}

fn status_message(controller: &PipelineController, message: Option<&str>) -> String {
    let status = controller.status();
    let mut msg = format!(" {} | {:.1} fps", status.state, status.counters.fps);

    match (&status.label, status.confidence) {
        (Some(label), Some(confidence)) => {
            msg.push_str(&format!(" | {} {:.0}%", label, confidence * 100.0));
        }
        _ => msg.push_str(" | no detection"),
    }
    if status.counters.frames_dropped > 0 {
        msg.push_str(&format!(" | dropped {}", status.counters.frames_dropped));
    }
    if let Some(message) = message {
        msg.push_str(" | ");
        msg.push_str(message);
    }
    msg.push_str(" | 'h' help");
    msg
}

fn help_message(state: PipelineState) -> String {
    let mut msg = String::from(" s: Save snapshot | ");
    if !state.is_active() {
        msg.push_str("r: Restart | ");
    }
    msg.push_str("h: Toggle help | q/Ctrl+C: Quit");
    msg
}

/// Widget that renders an image using half-block characters
struct FrameWidget {
    image: Option<RgbaImage>,
}

impl FrameWidget {
    fn new() -> Self {
        Self { image: None }
    }

    fn update(&mut self, image: RgbaImage) {
        self.image = Some(image);
    }
}

impl Widget for &FrameWidget {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let Some(image) = self.image.as_ref().filter(|i| i.width() > 0 && i.height() > 0)
        else {
            let msg = "Waiting for frames...";
            let x = area.x + (area.width.saturating_sub(msg.len() as u16)) / 2;
            let y = area.y + area.height / 2;
            if y < area.y + area.height && x < area.x + area.width {
                buf.set_string(x, y, msg, ratatui::style::Style::default());
            }
            return;
        };

        // Each terminal cell displays 2 vertical pixels
        let (width, height) = image.dimensions();
        let aspect = width as f64 / height as f64;
        let term_width = area.width as f64;
        let term_height = (area.height * 2) as f64;

        let (display_width, display_height) = if term_width / term_height > aspect {
            let h = term_height;
            ((h * aspect) as u16, (h / 2.0) as u16)
        } else {
            let w = term_width;
            (w as u16, (w / aspect / 2.0) as u16)
        };
        if display_width == 0 || display_height == 0 {
            return;
        }

        let x_offset = area.x + (area.width.saturating_sub(display_width)) / 2;
        let y_offset = area.y + (area.height.saturating_sub(display_height)) / 2;
        let x_scale = width as f64 / display_width as f64;
        let y_scale = height as f64 / (display_height * 2) as f64;

        for ty in 0..display_height {
            for tx in 0..display_width {
                let term_x = x_offset + tx;
                let term_y = y_offset + ty;
                if term_x >= area.x + area.width || term_y >= area.y + area.height {
                    continue;
                }

                let src_x = (tx as f64 * x_scale) as u32;
                let src_y_top = (ty as f64 * 2.0 * y_scale) as u32;
                let src_y_bottom = ((ty as f64 * 2.0 + 1.0) * y_scale) as u32;

                if let Some(cell) = buf.cell_mut((term_x, term_y)) {
                    cell.set_char('▀');
                    cell.set_fg(sample(image, src_x, src_y_top));
                    cell.set_bg(sample(image, src_x, src_y_bottom));
                }
            }
        }
    }
}

fn sample(image: &RgbaImage, x: u32, y: u32) -> Color {
    let p = image.get_pixel(x.min(image.width() - 1), y.min(image.height() - 1));
    Color::Rgb(p[0], p[1], p[2])
}

/// Status bar widget, colored by pipeline state
struct StatusBar<'a> {
    message: &'a str,
    state: PipelineState,
}

impl StatusBar<'_> {
    fn background(&self) -> Color {
        match self.state {
            PipelineState::Degraded => Color::Yellow,
            PipelineState::Failed => Color::Red,
            _ => Color::DarkGray,
        }
    }
}

impl Widget for StatusBar<'_> {
    fn render(self, area: Rect, buf: &mut Buffer) {
        let bg = self.background();
        for x in area.x..area.x + area.width {
            if let Some(cell) = buf.cell_mut((x, area.y)) {
                cell.set_char(' ');
                cell.set_bg(bg);
            }
        }

        let text: String = self.message.chars().take(area.width as usize).collect();
        let fg = if bg == Color::Yellow {
            Color::Black
        } else {
            Color::White
        };
        buf.set_string(
            area.x,
            area.y,
            text,
            ratatui::style::Style::default().fg(fg).bg(bg),
        );
    }
}
