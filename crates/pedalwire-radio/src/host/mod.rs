//! Platform radio backends.
//!
//! [`HostCentral`] drives the host Bluetooth stack through btleplug and
//! [`UsbStick`] claims a Dynastream ANT+ stick through nusb. Each sits
//! behind a cargo feature; without them the binary falls back to the
//! [`detached`](crate::detached) stand-ins.

#[cfg(feature = "btleplug")]
mod bluetooth;
#[cfg(feature = "usb")]
mod usb;

#[cfg(feature = "btleplug")]
pub use bluetooth::HostCentral;
#[cfg(feature = "usb")]
pub use usb::UsbStick;
