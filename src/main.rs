use std::env;

use loopback_rtc::{
    call,
    config::{init_log, DemoConfig},
    model::codec::{video_capabilities, CodecPreference},
    server, transform,
};

fn main() -> anyhow::Result<()> {
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        print_usage();
        return Ok(());
    };

    let mut config = DemoConfig::load()?;
    init_log(&config.log_filter);

    match command.as_str() {
        "transform" => {
            if let Some(frames) = args.get(2) {
                config.capture.frames = Some(frames.parse()?);
            }
            let stats = runtime()?.block_on(transform::run(config.capture))?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        "call" => {
            let preference = match args.get(2) {
                Some(selector) => CodecPreference::parse_selector(selector)?,
                None => None,
            };
            runtime()?.block_on(call::run(&config, preference))?;
        }
        "codecs" => {
            for capability in video_capabilities() {
                println!("{}", capability);
            }
        }
        "serve" => server::serve(config)?,
        _ => print_usage(),
    }

    Ok(())
}

/// Both demo flows run on a single-threaded event loop.
fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}

fn print_usage() {
    println!("Loopback RTC");
    println!("Usage:");
    println!("  loopback-rtc transform [frames]  - Run the GPU frame transform");
    println!("  loopback-rtc call [codec]        - Negotiate a loopback call, e.g. \"video/VP9 profile-id=0\"");
    println!("  loopback-rtc codecs              - List the video codec capabilities");
    println!("  loopback-rtc serve               - Start the HTTP control surface");
}
