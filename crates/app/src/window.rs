//! SDL2 window for the interactive preview.

use pianovis_core::{
    preview::{PreviewInput, PreviewStats, PreviewSurface},
    Frame, PianoVisError, Result,
};
use sdl2::{
    event::Event, keyboard::Keycode, pixels::PixelFormatEnum, render::Canvas, video::Window,
    EventPump,
};

const TITLE: &str = "PianoVis - Preview";

pub struct SdlSurface {
    canvas: Canvas<Window>,
    events: EventPump,
}

impl SdlSurface {
    pub fn open(width: u32, height: u32) -> Result<Self> {
        let sdl = sdl2::init().map_err(PianoVisError::msg)?;
        let video = sdl.video().map_err(PianoVisError::msg)?;
        let window = video
            .window(TITLE, width, height)
            .position_centered()
            .build()
            .map_err(|err| PianoVisError::msg(err.to_string()))?;
        let canvas = window
            .into_canvas()
            .accelerated()
            .build()
            .map_err(|err| PianoVisError::msg(err.to_string()))?;
        let events = sdl.event_pump().map_err(PianoVisError::msg)?;
        Ok(Self { canvas, events })
    }
}

impl PreviewSurface for SdlSurface {
    fn poll(&mut self) -> Result<Vec<PreviewInput>> {
        let mut inputs = Vec::new();
        for event in self.events.poll_iter() {
            let input = match event {
                Event::Quit { .. } => PreviewInput::Quit,
                Event::KeyDown {
                    keycode: Some(key), ..
                } => match key {
                    Keycode::Escape => PreviewInput::Quit,
                    Keycode::Left => PreviewInput::StepBack,
                    Keycode::Right => PreviewInput::StepForward,
                    Keycode::Down => PreviewInput::JumpBack,
                    Keycode::Up => PreviewInput::JumpForward,
                    Keycode::Space => PreviewInput::TogglePlayback,
                    _ => continue,
                },
                _ => continue,
            };
            inputs.push(input);
        }
        Ok(inputs)
    }

    fn present(&mut self, frame: &Frame, stats: Option<&PreviewStats>) -> Result<()> {
        let creator = self.canvas.texture_creator();
        let mut texture = creator
            .create_texture_streaming(PixelFormatEnum::RGB24, frame.width(), frame.height())
            .map_err(|err| PianoVisError::msg(err.to_string()))?;
        texture
            .update(None, frame.as_raw(), frame.width() as usize * 3)
            .map_err(|err| PianoVisError::msg(err.to_string()))?;

        self.canvas.clear();
        // Scales to the whole window.
        self.canvas.copy(&texture, None, None).map_err(PianoVisError::msg)?;
        self.canvas.present();

        if let Some(stats) = stats {
            self.canvas
                .window_mut()
                .set_title(&format!("{TITLE} | {stats}"))
                .map_err(|err| PianoVisError::msg(err.to_string()))?;
        }
        Ok(())
    }
}
