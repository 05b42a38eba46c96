//! Subsystem Resets
//!
//! See [Chapter 7](https://rptl.io/rp2350-datasheet#section_resets) for more details.

mod private {
    pub trait SubsystemReset {
        fn reset_bring_up(&self, resets: &mut crate::pac::RESETS);
        fn reset_bring_down(&self, resets: &mut crate::pac::RESETS);
    }
}

pub(crate) use private::SubsystemReset;

macro_rules! generate_reset {
    ($MODULE:ident, $module:ident) => {
        impl SubsystemReset for $crate::pac::$MODULE {
            fn reset_bring_up(&self, resets: &mut $crate::pac::RESETS) {
                resets.reset().modify(|_, w| w.$module().clear_bit());
                while resets.reset_done().read().$module().bit_is_clear() {}
            }
            fn reset_bring_down(&self, resets: &mut $crate::pac::RESETS) {
                resets.reset().modify(|_, w| w.$module().set_bit());
            }
        }
    };
}

// In datasheet order
generate_reset!(UART1, uart1);
generate_reset!(UART0, uart0);
generate_reset!(SPI1, spi1);
generate_reset!(SPI0, spi0);
generate_reset!(I2C1, i2c1);
generate_reset!(I2C0, i2c0);
generate_reset!(DMA, dma);
