pub mod bus;
pub mod legacy;
pub mod uart;

pub use bus::{DeviceKind, IrqLine, MmioBus};
pub use legacy::{Cmos, Com1, CMOS_PORT_DATA, CMOS_PORT_INDEX, SERIAL_COM1_BASE, SERIAL_COM1_END};
