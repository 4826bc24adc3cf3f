//! Waykit demo
//!
//! Opens one window, paints a teal background with a white square, and draws
//! a pulsing bar through a layered drawing context until the window is closed
//! or the process receives SIGINT.

use anyhow::{bail, Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use waykit::tiny_skia::Color;
use waykit::{Canvas, Config, Event, EventKind, Flow, Session};

/// Command line options
struct Args {
    /// Print the announced outputs as JSON and exit
    outputs: bool,
    width: u32,
    height: u32,
    display: Option<String>,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut args = Args {
            outputs: false,
            width: 400,
            height: 400,
            display: None,
        };

        let mut iter = std::env::args().skip(1);
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--outputs" => args.outputs = true,
                "--size" => {
                    let value = iter.next().context("--size needs a value like 400x400")?;
                    let (w, h) = value
                        .split_once('x')
                        .context("--size must look like WIDTHxHEIGHT")?;
                    args.width = w.parse().context("invalid width")?;
                    args.height = h.parse().context("invalid height")?;
                }
                "--display" => {
                    args.display = Some(iter.next().context("--display needs a socket name")?);
                }
                other => bail!("unknown argument {:?}", other),
            }
        }
        Ok(args)
    }
}

/// Context handler: a bar whose width follows the frame count
fn pulse_bar() -> impl FnMut(&Event, &mut Canvas<'_>) -> Flow {
    let mut frame = 0u32;
    move |event: &Event, canvas: &mut Canvas<'_>| {
        if event.kind == EventKind::Begin && event.repeat == 0 {
            info!("Pulse bar attached ({}x{})", canvas.width(), canvas.height());
        }

        frame = frame.wrapping_add(1);
        let phase = (frame % 120) as f32 / 120.0;
        canvas.clear(Color::from_rgba8(0x20, 0x20, 0x20, 0xff));
        canvas.fill_rect(
            0.0,
            0.0,
            canvas.width() as f32 * phase,
            canvas.height() as f32,
            Color::from_rgba8(0xff, 0xa0, 0x00, 0xff),
        );

        // Keep the animation alive on the next frame
        Flow::Recall
    }
}

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "waykit=debug,info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse()?;

    let mut config = Config::from_env().with_title("Waykit demo");
    if let Some(display) = args.display {
        config = config.with_display(display);
    }

    let mut session = Session::connect(config).context("Failed to connect to the compositor")?;

    if args.outputs {
        let json = serde_json::to_string_pretty(session.outputs())?;
        println!("{}", json);
        session.disconnect();
        return Ok(());
    }

    info!("Starting waykit demo ({}x{})", args.width, args.height);

    let window = session
        .create_window(args.width, args.height)
        .context("Failed to create window")?;

    window.register_draw(|width: u32, height: u32, canvas: &mut Canvas<'_>| {
        canvas.clear(Color::from_rgba(0.0, 0.7, 0.7, 1.0).unwrap_or(Color::BLACK));
        let side = width.min(height) as f32 / 2.0;
        canvas.fill_rect(
            (width as f32 - side) / 2.0,
            (height as f32 - side) / 2.0,
            side,
            side,
            Color::WHITE,
        );
    });

    window
        .create_context(pulse_bar(), 1, 10, 10, args.width.saturating_sub(20), 12)
        .context("Failed to create drawing context")?;

    let exit = session.run();

    session.destroy_window()?;
    session.disconnect();

    if exit.is_failure() {
        error!("Exiting after {:?}", exit);
        std::process::exit(1);
    }

    info!("Bye");
    Ok(())
}
