use core::convert::Infallible;

use super::{InputPin, Level, OutputPin};

impl embedded_hal::digital::v2::OutputPin for OutputPin {
    type Error = Infallible;

    fn set_low(&mut self) -> Result<(), Self::Error> {
        OutputPin::set_low(self);

        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        OutputPin::set_high(self);

        Ok(())
    }
}

impl embedded_hal::digital::v2::InputPin for InputPin {
    type Error = Infallible;

    fn is_high(&self) -> Result<bool, Self::Error> {
        Ok(InputPin::read(self) == Level::High)
    }

    fn is_low(&self) -> Result<bool, Self::Error> {
        Ok(InputPin::read(self) == Level::Low)
    }
}

#[cfg(test)]
mod tests {
    use embedded_hal::digital::v2::{InputPin as InputPinHal, OutputPin as OutputPinHal};

    use crate::gpio::{InputPin, OutputPin, TEST_REGISTER_GUARD};

    #[test]
    fn driving_pins_through_the_hal_traits() {
        let _guard = TEST_REGISTER_GUARD.lock().unwrap();

        let mut output = OutputPin::new(47).unwrap();
        OutputPinHal::set_high(&mut output).unwrap();
        OutputPinHal::set_low(&mut output).unwrap();

        let input = InputPin::new(46).unwrap();
        assert!(InputPinHal::is_low(&input).unwrap());
        assert!(!InputPinHal::is_high(&input).unwrap());
    }
}
