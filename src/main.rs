use heatgrid::SimConfig;

const GRID_WIDTH: u32 = 512;
const GRID_HEIGHT: u32 = 512;
const DIFFUSION_RATE: f32 = 0.25;
const SEED_RADIUS: f32 = 48.0;

fn main() -> anyhow::Result<()> {
    init_logging()?;

    heatgrid::run(SimConfig {
        grid_width: GRID_WIDTH,
        grid_height: GRID_HEIGHT,
        diffusion_rate: DIFFUSION_RATE,
        seed_radius: SEED_RADIUS,
    })
}

fn init_logging() -> Result<(), fern::InitError> {
    fern::Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {} {}] {}",
                humantime::format_rfc3339_seconds(std::time::SystemTime::now()),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(log::LevelFilter::Info)
        .chain(std::io::stdout())
        .apply()?;
    Ok(())
}
