use log::trace;

use crate::backend::OutputDescription;

/// DPI reported when an output does not provide one.
pub const DEFAULT_DPI: f32 = 96.0;

/// Represents A Display Attached To The Desktop
///
/// Descriptors are immutable; re-enumerating replaces the whole list.
///
/// # Example
/// ```no_run
/// # #[cfg(windows)]
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use screen_stream::capture::ScreenStream;
///
/// let stream = ScreenStream::dxgi();
/// for display in stream.enumerate()? {
///     println!("{display}");
/// }
/// # Ok(())
/// # }
/// # #[cfg(not(windows))]
/// # fn main() {}
/// ```
#[derive(PartialEq, Clone, Debug)]
pub struct Display {
    id: usize,
    name: String,
    width: u32,
    height: u32,
    is_primary: bool,
    left: i32,
    top: i32,
    dpi_x: f32,
    dpi_y: f32,
}

impl Display {
    /// Returns the id assigned at enumeration time, starting from 0.
    #[must_use]
    #[inline]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Returns the device name of the display.
    #[must_use]
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the width of the display in pixels.
    #[must_use]
    #[inline]
    pub const fn width(&self) -> u32 {
        self.width
    }

    /// Returns the height of the display in pixels.
    #[must_use]
    #[inline]
    pub const fn height(&self) -> u32 {
        self.height
    }

    /// Returns `true` when the desktop origin of the display is (0, 0).
    #[must_use]
    #[inline]
    pub const fn is_primary(&self) -> bool {
        self.is_primary
    }

    /// Returns the left edge of the display in desktop coordinates.
    #[must_use]
    #[inline]
    pub const fn left(&self) -> i32 {
        self.left
    }

    /// Returns the top edge of the display in desktop coordinates.
    #[must_use]
    #[inline]
    pub const fn top(&self) -> i32 {
        self.top
    }

    /// Returns the effective horizontal DPI.
    #[must_use]
    #[inline]
    pub const fn dpi_x(&self) -> f32 {
        self.dpi_x
    }

    /// Returns the effective vertical DPI.
    #[must_use]
    #[inline]
    pub const fn dpi_y(&self) -> f32 {
        self.dpi_y
    }

    /// Size in bytes of one packed RGB frame of this display.
    #[must_use]
    #[inline]
    pub const fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * 3
    }
}

impl std::fmt::Display for Display {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Display {}: {} ({}x{})", self.id, self.name, self.width, self.height)?;
        if self.is_primary {
            write!(f, " [PRIMARY]")?;
        }

        Ok(())
    }
}

/// Keeps the outputs attached to the desktop and numbers them.
///
/// Ids count attached outputs only, so a detached output never consumes one. Outputs
/// with an empty desktop rectangle are treated as detached.
pub(crate) fn from_outputs<O>(outputs: Vec<(OutputDescription, O)>) -> Vec<(Display, O)> {
    outputs
        .into_iter()
        .filter(|(desc, _)| {
            let usable = desc.attached_to_desktop && desc.desktop.width() > 0 && desc.desktop.height() > 0;
            if !usable {
                trace!(
                    "Skipping output {} of adapter {} ({}), not part of the desktop",
                    desc.output_index, desc.adapter_index, desc.device_name
                );
            }

            usable
        })
        .enumerate()
        .map(|(id, (desc, output))| {
            let display = Display {
                id,
                name: desc.device_name,
                width: desc.desktop.width().unsigned_abs(),
                height: desc.desktop.height().unsigned_abs(),
                is_primary: desc.desktop.left == 0 && desc.desktop.top == 0,
                left: desc.desktop.left,
                top: desc.desktop.top,
                dpi_x: desc.dpi.0,
                dpi_y: desc.dpi.1,
            };

            (display, output)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::DesktopRect;

    fn output(index: u32, rect: DesktopRect, attached: bool) -> (OutputDescription, u32) {
        let desc = OutputDescription {
            adapter_index: 0,
            output_index: index,
            device_name: format!("\\\\.\\DISPLAY{}", index + 1),
            desktop: rect,
            attached_to_desktop: attached,
            dpi: (DEFAULT_DPI, DEFAULT_DPI),
        };

        (desc, index)
    }

    #[test]
    fn detached_outputs_do_not_consume_ids() {
        let displays = from_outputs(vec![
            output(0, DesktopRect::new(0, 0, 1920, 1080), true),
            output(1, DesktopRect::new(0, 0, 0, 0), false),
            output(2, DesktopRect::new(1920, 0, 4480, 1440), true),
        ]);

        assert_eq!(displays.len(), 2);
        assert_eq!(displays[0].0.id(), 0);
        assert_eq!(displays[1].0.id(), 1);
        // The handle travels with its descriptor.
        assert_eq!(displays[1].1, 2);
        assert_eq!(displays[1].0.name(), "\\\\.\\DISPLAY3");
    }

    #[test]
    fn extents_and_primary_flag() {
        let displays = from_outputs(vec![
            output(0, DesktopRect::new(-2560, -200, 0, 1240), true),
            output(1, DesktopRect::new(0, 0, 1920, 1080), true),
        ]);

        let secondary = &displays[0].0;
        assert_eq!((secondary.width(), secondary.height()), (2560, 1440));
        assert_eq!((secondary.left(), secondary.top()), (-2560, -200));
        assert!(!secondary.is_primary());

        let primary = &displays[1].0;
        assert!(primary.is_primary());
        assert_eq!(primary.frame_len(), 1920 * 1080 * 3);
    }

    #[test]
    fn display_formatting() {
        let displays = from_outputs(vec![output(0, DesktopRect::new(0, 0, 800, 600), true)]);
        assert_eq!(displays[0].0.to_string(), "Display 0: \\\\.\\DISPLAY1 (800x600) [PRIMARY]");
    }
}
