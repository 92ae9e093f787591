// syscall.rs - the syscall number space
//
// A syscall is invoked with the number in r7 and up to four arguments in
// r0-r3; the result comes back in r0. The compiler lowers the names below
// to `mov r7, #N; svc #0` trampolines; the runtime dispatches on r7.
// Numbers outside this table return NOSYS.

// Process control.
pub const SYS_EXIT: u32 = 0;
pub const SYS_YIELD: u32 = 1;
pub const SYS_SLEEP: u32 = 2;
pub const SYS_TIME: u32 = 3;
// Integer division helpers. Compiler-internal: the codegen lowers `/` and
// `%` to these, so they have no entry in the C-visible name table.
pub const SYS_DIV: u32 = 4;
pub const SYS_MOD: u32 = 5;

// Memory.
pub const SYS_MALLOC: u32 = 10;
pub const SYS_FREE: u32 = 11;
pub const SYS_REALLOC: u32 = 12;

// File I/O.
pub const SYS_OPEN: u32 = 20;
pub const SYS_CLOSE: u32 = 21;
pub const SYS_READ: u32 = 22;
pub const SYS_WRITE: u32 = 23;
pub const SYS_SEEK: u32 = 24;

// Console.
pub const SYS_PUTCHAR: u32 = 30;
pub const SYS_GETCHAR: u32 = 31;
pub const SYS_PUTS: u32 = 32;

// GPIO.
pub const SYS_GPIO_INIT: u32 = 40;
pub const SYS_GPIO_DIR: u32 = 41;
pub const SYS_GPIO_PUT: u32 = 42;
pub const SYS_GPIO_GET: u32 = 43;
pub const SYS_GPIO_PULLS: u32 = 44;

// PWM.
pub const SYS_PWM_INIT: u32 = 50;
pub const SYS_PWM_SET_WRAP: u32 = 51;
pub const SYS_PWM_SET_LEVEL: u32 = 52;
pub const SYS_PWM_ENABLE: u32 = 53;

// ADC.
pub const SYS_ADC_INIT: u32 = 60;
pub const SYS_ADC_SELECT: u32 = 61;
pub const SYS_ADC_READ: u32 = 62;
pub const SYS_ADC_TEMP: u32 = 63;

// SPI.
pub const SYS_SPI_INIT: u32 = 70;
pub const SYS_SPI_WRITE: u32 = 71;
pub const SYS_SPI_READ: u32 = 72;
pub const SYS_SPI_TRANSFER: u32 = 73;

// I2C.
pub const SYS_I2C_INIT: u32 = 80;
pub const SYS_I2C_WRITE: u32 = 81;
pub const SYS_I2C_READ: u32 = 82;

/// The identifiers user C code may call directly. The compiler recognises
/// these and emits the trampoline instead of an external call.
pub const NAMES: &[(&str, u32)] = &[
    ("exit", SYS_EXIT),
    ("yield", SYS_YIELD),
    ("sleep_ms", SYS_SLEEP),
    ("time_ms", SYS_TIME),
    ("malloc", SYS_MALLOC),
    ("free", SYS_FREE),
    ("realloc", SYS_REALLOC),
    ("open", SYS_OPEN),
    ("close", SYS_CLOSE),
    ("read", SYS_READ),
    ("write", SYS_WRITE),
    ("seek", SYS_SEEK),
    ("putchar", SYS_PUTCHAR),
    ("getchar", SYS_GETCHAR),
    ("puts", SYS_PUTS),
    ("gpio_init", SYS_GPIO_INIT),
    ("gpio_dir", SYS_GPIO_DIR),
    ("gpio_put", SYS_GPIO_PUT),
    ("gpio_get", SYS_GPIO_GET),
    ("gpio_pulls", SYS_GPIO_PULLS),
    ("pwm_init", SYS_PWM_INIT),
    ("pwm_set_wrap", SYS_PWM_SET_WRAP),
    ("pwm_set_level", SYS_PWM_SET_LEVEL),
    ("pwm_enable", SYS_PWM_ENABLE),
    ("adc_init", SYS_ADC_INIT),
    ("adc_select", SYS_ADC_SELECT),
    ("adc_read", SYS_ADC_READ),
    ("adc_temp", SYS_ADC_TEMP),
    ("spi_init", SYS_SPI_INIT),
    ("spi_write", SYS_SPI_WRITE),
    ("spi_read", SYS_SPI_READ),
    ("spi_transfer", SYS_SPI_TRANSFER),
    ("i2c_init", SYS_I2C_INIT),
    ("i2c_write", SYS_I2C_WRITE),
    ("i2c_read", SYS_I2C_READ),
];

/// Look up a C identifier in the syscall name table.
pub fn by_name(name: &str) -> Option<u32> {
    NAMES.iter().find(|(n, _)| *n == name).map(|&(_, num)| num)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_lookup() {
        assert_eq!(by_name("putchar"), Some(SYS_PUTCHAR));
        assert_eq!(by_name("exit"), Some(SYS_EXIT));
        assert_eq!(by_name("printf"), None);
    }

    #[test]
    fn numbers_fit_the_mov_imm8_trampoline() {
        for &(_, num) in NAMES {
            assert!(num <= 255);
        }
    }
}
