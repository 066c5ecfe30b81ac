//! `Motor` trait for motorized stages.

use fastlab_types::InstrumentFault;

use crate::instrument::Instrument;

/// A motorized stage axis behind a remote motor-control server.
pub trait Motor: Instrument {
    /// Command the axis to move to `position` (server units).
    ///
    /// # Errors
    ///
    /// Returns the client's failure when the command is rejected or the link
    /// to the server is lost.
    fn move_to(&mut self, position: f64) -> Result<(), InstrumentFault>;

    /// Read the current axis position.
    ///
    /// # Errors
    ///
    /// Returns the client's failure when the position cannot be read.
    fn position(&mut self) -> Result<f64, InstrumentFault>;

    /// Set the axis travel speed.
    ///
    /// # Errors
    ///
    /// Returns the client's failure when the speed is rejected.
    fn set_speed(&mut self, speed: f64) -> Result<(), InstrumentFault>;
}

impl<T: Motor + ?Sized> Motor for Box<T> {
    fn move_to(&mut self, position: f64) -> Result<(), InstrumentFault> {
        (**self).move_to(position)
    }

    fn position(&mut self) -> Result<f64, InstrumentFault> {
        (**self).position()
    }

    fn set_speed(&mut self, speed: f64) -> Result<(), InstrumentFault> {
        (**self).set_speed(speed)
    }
}

/// Type-erased motor client, as handed out by a motor connector.
pub type MotorHandle = Box<dyn Motor>;

#[cfg(test)]
mod tests {
    use super::*;

    struct MockMotor {
        position: f64,
        speed: f64,
    }

    impl Instrument for MockMotor {}

    impl Motor for MockMotor {
        fn move_to(&mut self, position: f64) -> Result<(), InstrumentFault> {
            self.position = position;
            Ok(())
        }

        fn position(&mut self) -> Result<f64, InstrumentFault> {
            Ok(self.position)
        }

        fn set_speed(&mut self, speed: f64) -> Result<(), InstrumentFault> {
            if speed > 1000.0 {
                return Err(InstrumentFault::new("speed above axis limit"));
            }
            self.speed = speed;
            Ok(())
        }
    }

    #[test]
    fn boxed_motor_moves_and_reports_position() {
        let mut motor: MotorHandle = Box::new(MockMotor {
            position: 0.0,
            speed: 0.0,
        });
        motor.move_to(12.5).unwrap();
        assert_eq!(motor.position().unwrap(), 12.5);
    }

    #[test]
    fn boxed_motor_surfaces_client_failures() {
        let mut motor: MotorHandle = Box::new(MockMotor {
            position: 0.0,
            speed: 0.0,
        });
        let err = motor.set_speed(5000.0).unwrap_err();
        assert_eq!(err.message(), "speed above axis limit");
    }
}
