use emgba::devices::{FRAME_HEIGHT, FRAME_WIDTH};
use emgba::gba::gba;
use emgba::Emulator;
use minifb::{Key, Scale, Window, WindowOptions};
use std::env;
use std::fs;
use std::process;
use std::sync::mpsc::channel;

fn main() {
    env_logger::init();
    let mut rom_path = None;
    let mut debug = false;
    let mut pace = true;
    for arg in env::args().skip(1) {
        match arg.as_str() {
            "--debug" => debug = true,
            "--no-pace" => pace = false,
            path => rom_path = Some(path.to_string()),
        }
    }
    let rom_path = match rom_path {
        Some(path) => path,
        None => {
            eprintln!("usage: mygba [--debug] [--no-pace] <rom.gba>");
            process::exit(2);
        }
    };
    let image = match fs::read(&rom_path) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("could not read {}: {}", rom_path, e);
            process::exit(1);
        }
    };

    let mut config = gba();
    config.save_path = Some(std::path::Path::new(&rom_path).with_extension("sav"));
    let mut emulator = Emulator::new(config);
    if let Err(e) = emulator.load_rom(&image) {
        eprintln!("{}", e);
        process::exit(1);
    }

    if debug {
        emulator.run(true);
        return;
    }

    let mut window = Window::new(
        "mygba - ESC to exit",
        FRAME_WIDTH,
        FRAME_HEIGHT,
        WindowOptions { scale: Scale::X2, ..WindowOptions::default() },
    )
    .unwrap_or_else(|e| {
        panic!("{}", e);
    });

    // a 60 Hz tick channel paces the loop against real time
    let ticker = timer::Timer::new();
    let (tick, frame_clock) = channel();
    let _pacer = ticker.schedule_repeating(chrono::Duration::microseconds(16_742), move || {
        let _ = tick.send(());
    });

    let mut frames = 0u64;
    let mut fps = 60.0f64;
    let mut window_time = std::time::Instant::now();
    while window.is_open() && !window.is_key_down(Key::Escape) {
        emulator.set_inputs(key_mask(&window));
        emulator.run_frame();
        if let Some(frame) = emulator.frame_ready() {
            window
                .update_with_buffer(frame, FRAME_WIDTH, FRAME_HEIGHT)
                .expect("Error updating screen!");
        } else {
            window.update();
        }
        frames += 1;
        if frames % 60 == 0 {
            let smoothing = 0.2;
            let elapsed = window_time.elapsed().as_secs_f64();
            fps = fps * smoothing + (60.0 / elapsed) * (1.0 - smoothing);
            log::info!("fps: {:.1}", fps);
            window_time = std::time::Instant::now();
        }
        if pace {
            let _ = frame_clock.recv();
        }
    }
    if let Err(e) = emulator.persist() {
        log::warn!("{}", e);
    }
}

/// Collapse the host keyboard onto the KEYINPUT mask (0 = pressed).
fn key_mask(window: &Window) -> u16 {
    let bindings = [
        (Key::X, 0),          // A
        (Key::Z, 1),          // B
        (Key::RightShift, 2), // Select
        (Key::Enter, 3),      // Start
        (Key::Right, 4),
        (Key::Left, 5),
        (Key::Up, 6),
        (Key::Down, 7),
        (Key::S, 8), // R
        (Key::A, 9), // L
    ];
    let mut mask = 0x3ff;
    for &(key, bit) in bindings.iter() {
        if window.is_key_down(key) {
            mask &= !(1 << bit);
        }
    }
    mask
}
